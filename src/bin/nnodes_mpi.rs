//! MPI/multiprocessing sidecar: loads the payload dumped by
//! `Node::run_mpi`, resolves this process's rank, runs the task with its
//! slice of the arguments, and reports failure via a `{fname}.error` file
//! with a non-zero exit. Mirrors `mpi.py`'s `__main__` block.
//!
//! True MPI ranks come from the launcher's environment (`OMPI_COMM_WORLD_RANK`,
//! `PMI_RANK`, or `MV2_COMM_WORLD_RANK`); `--mp N` instead fans out N ranks
//! in-process, since the original's multiprocessing mode never actually
//! forks per rank either (it relies on the sidecar looping locally).

use clap::Parser;
use nnodes::mpi_payload::MpiPayload;
use nnodes::root::RootCtx;
use nnodes::{Directory, Node};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, OnceLock};

#[derive(Parser)]
#[command(name = "nnodes-mpi")]
struct Cli {
    /// File stem of the `<stem>.payload.json` dumped by the dispatcher.
    stem: String,

    /// Run this many ranks locally instead of reading an MPI rank from the
    /// environment.
    #[arg(long)]
    mp: Option<u32>,
}

fn env_rank() -> u32 {
    for var in ["OMPI_COMM_WORLD_RANK", "PMI_RANK", "MV2_COMM_WORLD_RANK"] {
        if let Ok(v) = std::env::var(var) {
            if let Ok(rank) = v.parse() {
                return rank;
            }
        }
    }
    0
}

async fn run_rank(payload: &MpiPayload, rank: usize, dir: &Directory) -> Result<(), String> {
    let ctx = Arc::new(RootCtx {
        adapter: Arc::new(nnodes::cluster::Local {
            cpus_per_node: 1,
            gpus_per_node: 0,
        }),
        dispatcher: nnodes::dispatcher::Dispatcher::new(
            Arc::new(nnodes::cluster::Local {
                cpus_per_node: 1,
                gpus_per_node: 0,
            }),
            1.0,
            1,
        ),
        state: Default::default(),
        debug: false,
        last_ping: AtomicI64::new(0),
        root_node: OnceLock::new(),
    });
    let node = Node::new_root(dir.clone(), ctx, Default::default());

    let nnodes::TaskRef::Import(module, symbol) = &payload.task else {
        return Err("MPI sidecar only supports Import tasks".to_string());
    };
    let f = nnodes::task::resolve(module, symbol).map_err(|e| e.to_string())?;

    let mut args = Vec::new();
    if let Some(arg) = &payload.arg {
        args.push(arg.clone());
    }
    if let Some(arg_mpi) = &payload.arg_mpi {
        if let Some(chunk) = arg_mpi.get(rank) {
            args.push(nnodes::Value::List(chunk.clone()));
        }
    }
    node.set_args(if args.is_empty() { None } else { Some(args) });

    f(node).await.map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let dir = Directory::new(std::env::current_dir().expect("cwd"));
    let fname = cli.stem.clone();

    let payload: MpiPayload = match dir.load_json(&format!("{fname}.payload.json")).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to load payload: {e}");
            std::process::exit(1);
        }
    };

    let ranks: Vec<usize> = match cli.mp {
        Some(n) => (0..n as usize).collect(),
        None => vec![env_rank() as usize],
    };

    let mut failed = false;
    for rank in ranks {
        if let Err(e) = run_rank(&payload, rank, &dir).await {
            eprintln!("{e}");
            let _ = dir.write(&format!("{fname}.error"), &format!("{e}\n")).await;
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
}
