//! Batch scanner: drives the face pipeline over a gallery on a dedicated
//! worker thread.
//!
//! One candidate is fully processed before the next begins — the model
//! sessions are a single shared resource and decoded photos are
//! memory-heavy, so there is deliberately no parallel fan-out. Per-photo
//! failures are recorded and skipped; only a failure to list the gallery
//! fails a scan as a whole.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use facematch_core::{is_match, Embedding, FaceEmbedding, PipelineError, ScoreError};

use crate::gallery::{Gallery, GalleryError, ImageId, ImageLoader, LoadError};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("gallery listing failed: {0}")]
    Gallery(#[from] GalleryError),
    #[error("reference photo unreadable: {0}")]
    ReferenceLoad(#[from] LoadError),
    #[error("reference photo: {0}")]
    Reference(#[from] PipelineError),
    #[error("scanner thread exited")]
    ChannelClosed,
}

/// Why one candidate was skipped. Never escapes the scan loop.
#[derive(Error, Debug)]
enum CandidateError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Score(#[from] ScoreError),
}

/// Outcome of a completed (or cancelled) scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Matching photos, in gallery order.
    pub matches: Vec<ImageId>,
    /// Number of candidates the gallery listed.
    pub total: usize,
    /// Candidates skipped because loading, detection or scoring failed.
    pub failures: usize,
    /// True when the scan stopped early on request.
    pub cancelled: bool,
}

/// Cooperative cancellation flag, checked between candidates.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Messages sent from async callers to the scanner thread.
enum ScanRequest {
    Reference {
        id: ImageId,
        reply: oneshot::Sender<Result<Embedding, ScanError>>,
    },
    Scan {
        reference: Embedding,
        threshold: f32,
        progress: mpsc::UnboundedSender<u8>,
        cancel: CancelFlag,
        reply: oneshot::Sender<Result<ScanReport, ScanError>>,
    },
}

/// Clone-safe handle to the scanner thread.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<ScanRequest>,
}

impl ScannerHandle {
    /// Compute the embedding of the reference photo.
    ///
    /// Unlike candidate processing, every failure here is surfaced: the
    /// caller must be told when the chosen photo has no usable face.
    pub async fn reference_embedding(&self, id: ImageId) -> Result<Embedding, ScanError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Reference { id, reply: reply_tx })
            .await
            .map_err(|_| ScanError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ScanError::ChannelClosed)?
    }

    /// Scan the gallery against `reference`.
    ///
    /// A progress percentage arrives on `progress` after every candidate,
    /// in order; the reply carries the ordered match list.
    pub async fn scan(
        &self,
        reference: Embedding,
        threshold: f32,
        progress: mpsc::UnboundedSender<u8>,
        cancel: CancelFlag,
    ) -> Result<ScanReport, ScanError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Scan {
                reference,
                threshold,
                progress,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ScanError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ScanError::ChannelClosed)?
    }
}

/// Spawn the scanner on a dedicated OS thread.
///
/// The thread owns the pipeline (and with it the model sessions) for its
/// whole lifetime; requests are processed strictly one at a time, so a
/// scan can never observe the pipeline mid-release.
pub fn spawn_scanner<P, G, L>(mut pipeline: P, gallery: G, loader: L) -> ScannerHandle
where
    P: FaceEmbedding + Send + 'static,
    G: Gallery + Send + 'static,
    L: ImageLoader + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ScanRequest>(4);

    std::thread::Builder::new()
        .name("facematch-scan".into())
        .spawn(move || {
            tracing::info!("scanner thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    ScanRequest::Reference { id, reply } => {
                        let _ = reply.send(run_reference(&mut pipeline, &loader, &id));
                    }
                    ScanRequest::Scan {
                        reference,
                        threshold,
                        progress,
                        cancel,
                        reply,
                    } => {
                        let result = run_scan(
                            &mut pipeline,
                            &gallery,
                            &loader,
                            &reference,
                            threshold,
                            &progress,
                            &cancel,
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("scanner thread exiting");
        })
        .expect("failed to spawn scanner thread");

    ScannerHandle { tx }
}

fn run_reference<P, L>(pipeline: &mut P, loader: &L, id: &ImageId) -> Result<Embedding, ScanError>
where
    P: FaceEmbedding,
    L: ImageLoader,
{
    let image = loader.load(id)?;
    let embedding = pipeline.face_embedding(&image)?;
    tracing::info!(photo = %id, "reference embedding ready");
    Ok(embedding)
}

fn run_scan<P, G, L>(
    pipeline: &mut P,
    gallery: &G,
    loader: &L,
    reference: &Embedding,
    threshold: f32,
    progress: &mpsc::UnboundedSender<u8>,
    cancel: &CancelFlag,
) -> Result<ScanReport, ScanError>
where
    P: FaceEmbedding,
    G: Gallery,
    L: ImageLoader,
{
    let candidates = gallery.list_images()?;
    let total = candidates.len();
    tracing::info!(total, threshold, "scan started");

    let mut matches = Vec::new();
    let mut failures = 0usize;

    for (index, id) in candidates.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(processed = index, "scan cancelled");
            return Ok(ScanReport {
                matches,
                total,
                failures,
                cancelled: true,
            });
        }

        match score_candidate(pipeline, loader, id, reference) {
            Ok(similarity) => {
                tracing::debug!(photo = %id, similarity, "candidate scored");
                if is_match(similarity, threshold) {
                    matches.push(id.clone());
                }
            }
            Err(err) => {
                // One bad photo must never abort the scan.
                failures += 1;
                tracing::warn!(photo = %id, error = %err, "candidate skipped");
            }
        }

        // Fire-and-forget: a departed listener is not an error
        let _ = progress.send(percent_done(index + 1, total));
    }

    tracing::info!(matched = matches.len(), failures, "scan finished");
    Ok(ScanReport {
        matches,
        total,
        failures,
        cancelled: false,
    })
}

fn score_candidate<P, L>(
    pipeline: &mut P,
    loader: &L,
    id: &ImageId,
    reference: &Embedding,
) -> Result<f32, CandidateError>
where
    P: FaceEmbedding,
    L: ImageLoader,
{
    let image = loader.load(id)?;
    let embedding = pipeline.face_embedding(&image)?;
    Ok(reference.similarity(&embedding)?)
}

/// Progress after `processed` of `total` candidates, as a rounded percent.
/// Monotone in `processed`; exactly 100 on the last candidate.
fn percent_done(processed: usize, total: usize) -> u8 {
    (processed as f32 * 100.0 / total as f32).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::collections::{HashSet, VecDeque};

    struct StubGallery(Vec<ImageId>);

    impl Gallery for StubGallery {
        fn list_images(&self) -> Result<Vec<ImageId>, GalleryError> {
            Ok(self.0.clone())
        }
    }

    struct FailingGallery;

    impl Gallery for FailingGallery {
        fn list_images(&self) -> Result<Vec<ImageId>, GalleryError> {
            Err(GalleryError::Unreadable {
                path: "/gone".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            })
        }
    }

    /// Loads a blank 1x1 image for every id except the listed failures.
    struct StubLoader {
        failing: HashSet<ImageId>,
    }

    impl StubLoader {
        fn ok() -> Self {
            Self {
                failing: HashSet::new(),
            }
        }

        fn failing_for(ids: &[&ImageId]) -> Self {
            Self {
                failing: ids.iter().map(|id| (*id).clone()).collect(),
            }
        }
    }

    impl ImageLoader for StubLoader {
        fn load(&self, id: &ImageId) -> Result<DynamicImage, LoadError> {
            if self.failing.contains(id) {
                return Err(LoadError::Decode {
                    id: id.to_string(),
                    source: image::ImageError::IoError(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "corrupt",
                    )),
                });
            }
            Ok(DynamicImage::new_rgb8(1, 1))
        }
    }

    /// Returns one queued result per call, in order.
    struct SeqEmbedder {
        results: VecDeque<Result<Embedding, PipelineError>>,
    }

    impl SeqEmbedder {
        fn new(results: Vec<Result<Embedding, PipelineError>>) -> Self {
            Self {
                results: results.into(),
            }
        }
    }

    impl FaceEmbedding for SeqEmbedder {
        fn face_embedding(&mut self, _: &DynamicImage) -> Result<Embedding, PipelineError> {
            self.results
                .pop_front()
                .unwrap_or(Err(PipelineError::NoFaceDetected))
        }
    }

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: None,
        }
    }

    fn ids(names: &[&str]) -> Vec<ImageId> {
        names.iter().map(|n| ImageId::new(*n)).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<u8>) -> Vec<u8> {
        let mut events = Vec::new();
        while let Ok(p) = rx.try_recv() {
            events.push(p);
        }
        events
    }

    #[test]
    fn test_percent_done_rounding() {
        assert_eq!(percent_done(1, 3), 33);
        assert_eq!(percent_done(2, 3), 67);
        assert_eq!(percent_done(3, 3), 100);
        assert_eq!(percent_done(1, 1), 100);
    }

    #[test]
    fn test_percent_done_monotone() {
        let total = 7;
        let mut last = 0;
        for processed in 1..=total {
            let p = percent_done(processed, total);
            assert!(p >= last, "{p} < {last}");
            last = p;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_scan_empty_gallery() {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut pipeline = SeqEmbedder::new(vec![]);
        let reference = embedding(&[1.0, 0.0]);

        let report = run_scan(
            &mut pipeline,
            &StubGallery(vec![]),
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(report.matches.is_empty());
        assert_eq!(report.total, 0);
        assert!(drain(&mut progress_rx).is_empty());
    }

    #[test]
    fn test_scan_matches_near_duplicate_only() {
        // Near-duplicate, unrelated face, and a photo with no face at all.
        let candidates = ids(&["near_dup.jpg", "stranger.jpg", "landscape.jpg"]);
        let reference = embedding(&[1.0, 0.0, 0.0]);

        let mut pipeline = SeqEmbedder::new(vec![
            Ok(embedding(&[0.99, 0.14, 0.0])), // similarity ~0.99
            Ok(embedding(&[0.1, 0.99, 0.0])),  // similarity ~0.1
            Err(PipelineError::NoFaceDetected),
        ]);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let report = run_scan(
            &mut pipeline,
            &StubGallery(candidates.clone()),
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(report.matches, vec![candidates[0].clone()]);
        assert_eq!(report.total, 3);
        assert_eq!(report.failures, 1);
        assert!(!report.cancelled);
        assert_eq!(drain(&mut progress_rx), vec![33, 67, 100]);
    }

    #[test]
    fn test_scan_survives_load_failure() {
        let candidates = ids(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
        let reference = embedding(&[1.0, 0.0]);

        // b.jpg never loads; the other three produce embeddings.
        let loader = StubLoader::failing_for(&[&candidates[1]]);
        let mut pipeline = SeqEmbedder::new(vec![
            Ok(embedding(&[1.0, 0.0])),
            Ok(embedding(&[0.0, 1.0])),
            Ok(embedding(&[1.0, 0.0])),
        ]);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let report = run_scan(
            &mut pipeline,
            &StubGallery(candidates.clone()),
            &loader,
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        )
        .unwrap();

        // Matches come from the other three candidates, in gallery order.
        assert_eq!(
            report.matches,
            vec![candidates[0].clone(), candidates[3].clone()]
        );
        assert_eq!(report.failures, 1);

        // Still one progress event per candidate, ending at exactly 100.
        let events = drain(&mut progress_rx);
        assert_eq!(events.len(), 4);
        assert_eq!(*events.last().unwrap(), 100);
    }

    #[test]
    fn test_scan_threshold_is_strict() {
        let candidates = ids(&["exact.jpg"]);
        let reference = embedding(&[1.0, 0.0]);
        // similarity is exactly 0.6
        let mut pipeline = SeqEmbedder::new(vec![Ok(embedding(&[0.6, 0.8]))]);

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let report = run_scan(
            &mut pipeline,
            &StubGallery(candidates),
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(report.matches.is_empty());
    }

    #[test]
    fn test_scan_dimension_mismatch_is_candidate_failure() {
        let candidates = ids(&["odd.jpg", "good.jpg"]);
        let reference = embedding(&[1.0, 0.0]);
        let mut pipeline = SeqEmbedder::new(vec![
            Ok(embedding(&[1.0, 0.0, 0.0])), // wrong dimension
            Ok(embedding(&[1.0, 0.0])),
        ]);

        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let report = run_scan(
            &mut pipeline,
            &StubGallery(candidates.clone()),
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(report.matches, vec![candidates[1].clone()]);
        assert_eq!(report.failures, 1);
    }

    #[test]
    fn test_scan_gallery_failure_is_fatal() {
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let mut pipeline = SeqEmbedder::new(vec![]);
        let reference = embedding(&[1.0, 0.0]);

        let result = run_scan(
            &mut pipeline,
            &FailingGallery,
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &CancelFlag::new(),
        );

        assert!(matches!(result, Err(ScanError::Gallery(_))));
    }

    #[test]
    fn test_scan_cancelled_before_start() {
        let candidates = ids(&["a.jpg", "b.jpg"]);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut pipeline = SeqEmbedder::new(vec![]);
        let reference = embedding(&[1.0, 0.0]);

        let report = run_scan(
            &mut pipeline,
            &StubGallery(candidates),
            &StubLoader::ok(),
            &reference,
            0.6,
            &progress_tx,
            &cancel,
        )
        .unwrap();

        assert!(report.cancelled);
        assert!(report.matches.is_empty());
        assert!(drain(&mut progress_rx).is_empty());
    }

    #[tokio::test]
    async fn test_handle_reference_and_scan() {
        let candidates = ids(&["match.jpg", "other.jpg"]);
        let pipeline = SeqEmbedder::new(vec![
            Ok(embedding(&[1.0, 0.0])), // reference
            Ok(embedding(&[1.0, 0.0])), // match.jpg
            Ok(embedding(&[0.0, 1.0])), // other.jpg
        ]);

        let handle = spawn_scanner(pipeline, StubGallery(candidates.clone()), StubLoader::ok());

        let reference = handle
            .reference_embedding(ImageId::new("reference.jpg"))
            .await
            .unwrap();

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let report = handle
            .scan(reference, 0.6, progress_tx, CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.matches, vec![candidates[0].clone()]);
        assert_eq!(drain(&mut progress_rx), vec![50, 100]);
    }

    #[tokio::test]
    async fn test_handle_reference_failure_is_surfaced() {
        let pipeline = SeqEmbedder::new(vec![Err(PipelineError::NoFaceDetected)]);
        let handle = spawn_scanner(pipeline, StubGallery(vec![]), StubLoader::ok());

        let result = handle.reference_embedding(ImageId::new("blank.jpg")).await;
        assert!(matches!(
            result,
            Err(ScanError::Reference(PipelineError::NoFaceDetected))
        ));
    }
}
