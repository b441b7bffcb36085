use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use trapex_core::{Facing, ScanConfig};
use trapex_ocr::ReceiptArchive;

mod commands;
mod watcher;

pub struct AppState {
    pub config: ScanConfig,
    /// Root of the app's data (~/.local/share/trapex on Linux).
    pub data_dir: PathBuf,
    /// Content-addressed store for exported receipt images.
    pub archive: ReceiptArchive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "trapex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Capture receipts and extract their text", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "TRAPEX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one receipt image and print its text
    Scan {
        /// Image file standing in for the camera frame
        #[arg(long)]
        image: PathBuf,

        /// Camera facing the frame came from (front, back)
        #[arg(long)]
        facing: Option<Facing>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,

        /// Also store a compressed copy of the normalized image in the archive
        #[arg(long)]
        export: bool,
    },
    /// Watch an intake folder and scan every image dropped into it
    Watch {
        /// Folder to watch (defaults to <data dir>/intake)
        #[arg(long)]
        intake: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config.clone().or_else(ScanConfig::default_path) {
        Some(path) => ScanConfig::load_or_default(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ScanConfig::default(),
    };
    config.apply_env_overrides();

    let project_dirs = directories::ProjectDirs::from("com", "trapex", "Trapex")
        .context("Failed to get app directory")?;
    let data_dir = project_dirs.data_dir().to_path_buf();
    let archive = ReceiptArchive::new(
        config
            .export
            .dir
            .clone()
            .unwrap_or_else(|| data_dir.join("attachments")),
    );

    let state = AppState { config, data_dir, archive };

    let succeeded = match cli.command {
        Commands::Scan { image, facing, output, export } => {
            let facing = facing.unwrap_or(state.config.camera.facing);
            commands::scan(&state, &image, facing, output, export).await?
        }
        Commands::Watch { intake, output } => {
            let intake = intake.unwrap_or_else(|| state.data_dir.join("intake"));
            commands::watch(&state, &intake, output).await?;
            true
        }
    };

    Ok(if succeeded { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
