use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use facematch_core::{
    preprocess, Detector, FaceEmbedding, FaceNetEmbedder, FacePipeline, ScrfdDetector,
};
use facematch_scan::{spawn_scanner, CancelFlag, Config, FsGallery, FsImageLoader, ImageId};

#[derive(Parser)]
#[command(name = "facematch", about = "Find gallery photos matching a reference face")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the gallery for photos matching the reference face
    Scan {
        /// Reference photo containing the face to search for
        #[arg(short, long)]
        reference: PathBuf,
        /// Gallery directory (defaults to FACEMATCH_GALLERY_DIR)
        #[arg(short, long)]
        gallery: Option<PathBuf>,
        /// Cosine similarity threshold for a positive match
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Print the scan report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Detect faces in a single photo (diagnostics)
    Detect {
        photo: PathBuf,
    },
    /// Print the face embedding of a single photo
    Embed {
        photo: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            reference,
            gallery,
            threshold,
            json,
        } => scan_command(&config, &reference, gallery, threshold, json).await,
        Commands::Detect { photo } => detect_command(&config, &photo),
        Commands::Embed { photo } => embed_command(&config, &photo),
    }
}

async fn scan_command(
    config: &Config,
    reference: &Path,
    gallery: Option<PathBuf>,
    threshold: Option<f32>,
    json: bool,
) -> Result<()> {
    let threshold = threshold.unwrap_or(config.match_threshold);
    let gallery_dir = gallery.unwrap_or_else(|| config.gallery_dir.clone());

    let detector = ScrfdDetector::load(&config.detect_model_path())?;
    let embedder = FaceNetEmbedder::new(config.embed_model_path());
    let pipeline =
        FacePipeline::new(detector, embedder).with_max_dimension(config.max_image_dimension);

    let scanner = spawn_scanner(pipeline, FsGallery::new(&gallery_dir), FsImageLoader);

    let reference_embedding = scanner
        .reference_embedding(ImageId::from(reference))
        .await
        .context("could not compute an embedding for the reference photo")?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let cancel = CancelFlag::new();

    let progress_task = tokio::spawn(async move {
        while let Some(percent) = progress_rx.recv().await {
            eprint!("\rscanning {percent:3}%");
        }
        eprintln!();
    });

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("stopping after the current photo");
            ctrl_c_cancel.cancel();
        }
    });

    let report = scanner
        .scan(reference_embedding, threshold, progress_tx, cancel)
        .await?;
    let _ = progress_task.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for id in &report.matches {
            println!("{id}");
        }
        eprintln!(
            "{} of {} photos matched, {} skipped{}",
            report.matches.len(),
            report.total,
            report.failures,
            if report.cancelled { " (scan cancelled)" } else { "" }
        );
    }

    Ok(())
}

fn detect_command(config: &Config, photo: &Path) -> Result<()> {
    let image = image::open(photo).with_context(|| format!("cannot open {}", photo.display()))?;

    let mut detector = ScrfdDetector::load(&config.detect_model_path())?;
    let scaled = preprocess::scale_down(&image, config.max_image_dimension);
    let faces = detector.detect(&scaled)?;

    if faces.is_empty() {
        println!("no faces detected");
    } else {
        for face in &faces {
            println!(
                "{}x{} at ({}, {}), confidence {:.2}",
                face.bbox.width(),
                face.bbox.height(),
                face.bbox.left,
                face.bbox.top,
                face.confidence
            );
        }
    }

    Ok(())
}

fn embed_command(config: &Config, photo: &Path) -> Result<()> {
    let image = image::open(photo).with_context(|| format!("cannot open {}", photo.display()))?;

    let detector = ScrfdDetector::load(&config.detect_model_path())?;
    let embedder = FaceNetEmbedder::new(config.embed_model_path());
    let mut pipeline =
        FacePipeline::new(detector, embedder).with_max_dimension(config.max_image_dimension);

    let embedding = pipeline.face_embedding(&image)?;
    println!("{}", serde_json::to_string(&embedding.values)?);

    Ok(())
}
