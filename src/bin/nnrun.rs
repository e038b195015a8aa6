//! Runs the workflow rooted in the current directory, resuming from
//! `root.pickle` if present. Mirrors `scripts/nnrun.py`.

use clap::Parser;
use nnodes::{Directory, Root};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "nnrun", about = "Run (or resume) a nnodes workflow")]
struct Cli {
    /// Discard any existing checkpoint and start the workflow fresh.
    #[arg(short = 'r', long)]
    restart: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let dir = Directory::new(std::env::current_dir().expect("cwd"));

    if cli.restart {
        if let Err(e) = dir.rm("root.pickle").await {
            tracing::warn!(error = %e, "failed to remove root.pickle");
        }
    }

    let root = match Root::init(dir).await {
        Ok(root) => root,
        Err(e) => {
            eprintln!("failed to initialize workflow: {e}");
            std::process::exit(1);
        }
    };

    let start = Instant::now();
    root.execute().await;
    println!("elapsed: {}", format_elapsed(start.elapsed().as_secs_f64()));
}

fn format_elapsed(seconds: f64) -> String {
    let total = seconds.round().max(0.0) as i64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h}:{m:02}:{s:02}")
}
