//! Prints the status tree of the workflow rooted in the current directory.
//! Mirrors `scripts/nnlog.py`.

use clap::Parser;
use nnodes::{Directory, Root};

#[derive(Parser)]
#[command(name = "nnlog", about = "Print the status tree of a nnodes workflow")]
struct Cli {
    /// Print every node, not just unfinished/failed ones.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let dir = Directory::new(std::env::current_dir().expect("cwd"));

    let root = match Root::init(dir).await {
        Ok(root) => root,
        Err(e) => {
            eprintln!("failed to initialize workflow: {e}");
            std::process::exit(1);
        }
    };

    println!("{}", root.node.stat(cli.verbose));
}
