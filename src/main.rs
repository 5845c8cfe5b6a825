//! `pdown` - download a file over parallel HTTP range requests.

use clap::Parser;
use log::{info, LevelFilter};
use pdown::{DownloadError, DownloadTask, TaskConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pdown",
    version,
    about = "Pdown is a parallel downloader",
    long_about = "Pdown is a parallel downloader that uses concurrent connections to download files"
)]
struct Cli {
    /// Link of the file to download
    url: String,

    /// Number of concurrent connections (defaults to the number of CPU cores)
    #[arg(long)]
    thread: Option<usize>,

    /// File name to save to the disk
    #[arg(long)]
    name: Option<String>,

    /// Directory to save into
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Extra attempts per failed slice
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Fetch every slice again even if an earlier run left some complete
    #[arg(long)]
    restart: bool,

    /// Do not draw a progress bar
    #[arg(long)]
    no_progress: bool,

    /// Print verbose logs
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> TaskConfig {
        let defaults = TaskConfig::default();
        TaskConfig {
            workers: self.thread.unwrap_or(defaults.workers),
            file_name: self.name.clone(),
            output_dir: self.dir.clone(),
            max_retries: self.retries,
            show_progress: !self.no_progress,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut task = match DownloadTask::new(cli.url.clone(), cli.config()).await {
        Ok(task) => task,
        Err(e) => {
            eprintln!("pdown: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = task.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping slices.");
            cancel.cancel();
        }
    });

    let resumable = task.slice_complete().iter().any(|done| *done);
    let result = if resumable && !cli.restart {
        task.resume().await
    } else {
        task.start().await
    };

    match result {
        Ok(()) => {
            println!("Saved {}", task.target_path().display());
            ExitCode::SUCCESS
        }
        Err(DownloadError::Incomplete { failures }) => {
            for failure in &failures {
                eprintln!("failed to download slice {}: {}", failure.id, failure.error);
            }
            eprintln!(
                "download incomplete, partial data kept in {}; run the same command again to continue",
                task.temp_path().display()
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("pdown: {e}");
            ExitCode::FAILURE
        }
    }
}
