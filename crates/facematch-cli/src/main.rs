use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::{
    FaceService, OnnxExtractor, ResizePolicy, ServiceSettings, TempSweeper, UploadedFile,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "facematch", about = "Face registration and comparison CLI")]
struct Cli {
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true, default_value = "models")]
    model_dir: PathBuf,

    /// Gallery of reference images, one file per identity
    #[arg(long, global = true, default_value = "known_faces")]
    known_faces: PathBuf,

    /// Where uploads and face crops are written
    #[arg(long, global = true, default_value = "static/temp")]
    temp_dir: PathBuf,

    /// Maximum Euclidean distance accepted as a match
    #[arg(long, global = true, default_value_t = facematch_core::matcher::DEFAULT_TOLERANCE)]
    tolerance: f32,

    /// Resize inputs before detection: WxH or "original"
    #[arg(long, global = true, default_value = "original")]
    resize: ResizePolicy,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify every face in an image against the gallery
    Identify {
        image: PathBuf,
    },
    /// Check whether the faces in IMAGE match the first face in OTHER
    Compare {
        image: PathBuf,
        other: PathBuf,
    },
    /// Add an image to the gallery under NAME
    Register {
        #[arg(short, long)]
        name: String,
        image: PathBuf,
        /// Store the image even if no face is detected
        #[arg(long)]
        skip_face_check: bool,
    },
    /// List registered identities
    Gallery,
    /// Delete temp files older than the retention period
    Sweep {
        #[arg(long, default_value_t = facematch_core::sweep::DEFAULT_RETENTION.as_secs())]
        retention_secs: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Identify { image } => {
            let service = open_service(&cli, true)?;
            let response = service.compare("db", Some(read_upload(image)?), None)?;
            print_json(&response)
        }
        Commands::Compare { image, other } => {
            let service = open_service(&cli, true)?;
            let response = service.compare(
                "upload",
                Some(read_upload(image)?),
                Some(read_upload(other)?),
            )?;
            print_json(&response)
        }
        Commands::Register {
            name,
            image,
            skip_face_check,
        } => {
            let service = open_service(&cli, !skip_face_check)?;
            let response = service.register(name, Some(read_upload(image)?))?;
            print_json(&response)
        }
        Commands::Gallery => {
            let gallery = facematch_core::Gallery::open(&cli.known_faces)?;
            let names: Vec<String> = gallery.entries()?.into_iter().map(|e| e.name).collect();
            if names.is_empty() {
                eprintln!("No faces registered in {}", cli.known_faces.display());
            }
            print_json(&names)
        }
        Commands::Sweep { retention_secs } => {
            if !cli.temp_dir.is_dir() {
                bail!("temp directory {} does not exist", cli.temp_dir.display());
            }
            let report = TempSweeper::new(&cli.temp_dir, Duration::from_secs(*retention_secs))
                .sweep()
                .with_context(|| format!("failed to sweep {}", cli.temp_dir.display()))?;
            println!(
                "scanned {}, deleted {}, failed {}",
                report.scanned, report.deleted, report.failed
            );
            Ok(())
        }
    }
}

fn settings(cli: &Cli, require_face_on_register: bool) -> ServiceSettings {
    ServiceSettings {
        known_faces_dir: cli.known_faces.clone(),
        temp_dir: cli.temp_dir.clone(),
        tolerance: cli.tolerance,
        resize: cli.resize,
        require_face_on_register,
        ..ServiceSettings::default()
    }
}

fn open_service(cli: &Cli, require_face_on_register: bool) -> Result<FaceService> {
    tracing::debug!(model_dir = %cli.model_dir.display(), "loading face models");
    let extractor = OnnxExtractor::load(&cli.model_dir)
        .with_context(|| format!("failed to load face models from {}", cli.model_dir.display()))?;
    let service = FaceService::new(settings(cli, require_face_on_register), Arc::new(extractor))?;
    Ok(service)
}

fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(UploadedFile { file_name, bytes })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
