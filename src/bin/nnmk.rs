//! Writes a job submission script (and a copy of `config.toml`) for the
//! workflow rooted in the current directory, optionally into a subdirectory.
//! Mirrors `scripts/nnmk.py` / `job.py::Job.create`.

use clap::Parser;
use nnodes::cluster::SubmitScriptOpts;
use nnodes::config::Config;
use nnodes::Directory;

#[derive(Parser)]
#[command(name = "nnmk", about = "Write a job submission script for a nnodes workflow")]
struct Cli {
    /// Subdirectory to write the job script into; defaults to the current directory.
    dst: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let dir = Directory::new(std::env::current_dir().expect("cwd"));

    let config: Config = match dir.load_toml("config.toml").await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to read config.toml: {e}");
            std::process::exit(1);
        }
    };

    let adapter = match config.job.build_adapter() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("failed to build cluster adapter: {e}");
            std::process::exit(1);
        }
    };

    let dst = cli.dst.unwrap_or_else(|| ".".to_string());
    let script_name = adapter.submit_script_name();

    if dir.subdir(&dst).has(script_name) {
        eprintln!("{script_name} already exists in {dst}");
        std::process::exit(1);
    }

    let opts = SubmitScriptOpts {
        name: config.job.name.clone(),
        dst_label: dst.clone(),
        nnodes: config.job.nnodes,
        walltime_minutes: config.job.walltime,
        account: config.job.account.clone(),
        debug: config.job.debug,
    };
    let script = adapter.render_submit_script(
        "python -c \"from nnodes import root; root.run()\"",
        &opts,
    );

    let target = dir.subdir(&dst);
    if let Err(e) = target.mkdir().await {
        eprintln!("failed to create {dst}: {e}");
        std::process::exit(1);
    }
    if let Err(e) = target.write(script_name, &script).await {
        eprintln!("failed to write {script_name}: {e}");
        std::process::exit(1);
    }

    match dir.read("config.toml").await {
        Ok(contents) => {
            if let Err(e) = target.write("config.toml", &contents).await {
                eprintln!("failed to copy config.toml: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("failed to read config.toml: {e}");
            std::process::exit(1);
        }
    }

    println!("wrote {}/{script_name}", dst);
}
