//! Cluster adapters.
//!
//! A `ClusterAdapter` encapsulates one scheduler's hardware constants and
//! launch/requeue conventions. The dispatcher and node engine are oblivious
//! to which one is plugged in. The exact flag strings a real cluster expects
//! (`jsrun`, `srun`, ...) are data owned by these adapters, not core design.

use async_trait::async_trait;
use std::time::SystemTime;

/// Capability set every cluster adapter must provide.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    fn cpus_per_node(&self) -> u32;
    fn gpus_per_node(&self) -> u32;

    /// May a single physical node host multiple MPI tasks simultaneously?
    fn node_splittable(&self) -> bool;

    /// Submit tasks via a local process pool instead of MPI.
    fn use_multiprocessing(&self) -> bool;

    /// True iff the driver is running inside a scheduler allocation.
    fn in_queue(&self) -> bool;

    /// Minutes of walltime left, or `None` if not running inside an allocation.
    fn remaining(&self) -> Option<f64>;

    /// Render the concrete MPI launch command for `cmd`.
    fn mpiexec(&self, cmd: &str, nprocs: u32, cpus_per_proc: u32, gpus_per_proc: u32, mps: Option<u32>) -> String;

    /// Resubmit the current allocation. No-op outside a queue.
    async fn requeue(&self);

    /// Whether this adapter allows the root to auto-requeue on failure.
    fn allows_auto_requeue(&self) -> bool {
        true
    }

    /// File name the submission script should be written under.
    fn submit_script_name(&self) -> &'static str {
        "job.sh"
    }

    /// Render the job submission script body for `cmd`. Most adapters have
    /// no scheduler directives to add; `Lsf` overrides this with a `#BSUB`
    /// header (mirrors `job.py`'s `Job.write`/`LSF.write`).
    fn render_submit_script(&self, cmd: &str, _opts: &SubmitScriptOpts) -> String {
        format!("{cmd}\n")
    }
}

/// Parameters available when rendering a job submission script, gathered
/// from `[job]` config rather than the adapter itself.
pub struct SubmitScriptOpts {
    pub name: Option<String>,
    pub dst_label: String,
    pub nnodes: u32,
    pub walltime_minutes: f64,
    pub account: Option<String>,
    pub debug: bool,
}

/// Walltime bookkeeping shared by the queue-backed adapters below.
#[derive(Debug, Clone, Copy)]
pub struct WalltimeBudget {
    pub start: SystemTime,
    pub walltime_minutes: f64,
    pub gap_minutes: f64,
}

impl WalltimeBudget {
    pub fn remaining(&self) -> f64 {
        let elapsed = SystemTime::now()
            .duration_since(self.start)
            .unwrap_or_default()
            .as_secs_f64()
            / 60.0;
        (self.walltime_minutes - self.gap_minutes - elapsed).max(0.0)
    }
}

/// Local (no scheduler) adapter: MPI semantics, never in queue.
pub struct Local {
    pub cpus_per_node: u32,
    pub gpus_per_node: u32,
}

#[async_trait]
impl ClusterAdapter for Local {
    fn cpus_per_node(&self) -> u32 {
        self.cpus_per_node
    }
    fn gpus_per_node(&self) -> u32 {
        self.gpus_per_node
    }
    fn node_splittable(&self) -> bool {
        true
    }
    fn use_multiprocessing(&self) -> bool {
        false
    }
    fn in_queue(&self) -> bool {
        false
    }
    fn remaining(&self) -> Option<f64> {
        None
    }
    fn mpiexec(&self, cmd: &str, nprocs: u32, _cpus_per_proc: u32, _gpus_per_proc: u32, _mps: Option<u32>) -> String {
        format!("mpirun -np {} {}", nprocs, cmd)
    }
    async fn requeue(&self) {}
    fn allows_auto_requeue(&self) -> bool {
        false
    }
}

/// Local, multiprocessing-only adapter: no MPI launcher at all.
pub struct LocalMpi {
    pub cpus_per_node: u32,
}

#[async_trait]
impl ClusterAdapter for LocalMpi {
    fn cpus_per_node(&self) -> u32 {
        self.cpus_per_node
    }
    fn gpus_per_node(&self) -> u32 {
        0
    }
    fn node_splittable(&self) -> bool {
        true
    }
    fn use_multiprocessing(&self) -> bool {
        true
    }
    fn in_queue(&self) -> bool {
        false
    }
    fn remaining(&self) -> Option<f64> {
        None
    }
    fn mpiexec(&self, cmd: &str, _nprocs: u32, _cpus_per_proc: u32, _gpus_per_proc: u32, _mps: Option<u32>) -> String {
        cmd.to_string()
    }
    async fn requeue(&self) {}
    fn allows_auto_requeue(&self) -> bool {
        false
    }
}

/// Generic Slurm-family adapter (Tiger/Traverse/DTN share this shape; they
/// differ only in the constants passed at construction).
pub struct Slurm {
    pub cpus_per_node: u32,
    pub gpus_per_node: u32,
    pub budget: Option<WalltimeBudget>,
    pub job_id: Option<String>,
}

#[async_trait]
impl ClusterAdapter for Slurm {
    fn cpus_per_node(&self) -> u32 {
        self.cpus_per_node
    }
    fn gpus_per_node(&self) -> u32 {
        self.gpus_per_node
    }
    fn node_splittable(&self) -> bool {
        true
    }
    fn use_multiprocessing(&self) -> bool {
        false
    }
    fn in_queue(&self) -> bool {
        self.budget.is_some()
    }
    fn remaining(&self) -> Option<f64> {
        self.budget.map(|b| b.remaining())
    }
    fn mpiexec(&self, cmd: &str, nprocs: u32, cpus_per_proc: u32, gpus_per_proc: u32, _mps: Option<u32>) -> String {
        let mut parts = vec![format!("srun -n {nprocs} -c {cpus_per_proc}")];
        if gpus_per_proc > 0 {
            parts.push(format!("--gpus-per-task={gpus_per_proc}"));
        }
        parts.push(cmd.to_string());
        parts.join(" ")
    }
    async fn requeue(&self) {
        if let Some(job_id) = &self.job_id {
            tracing::info!(job_id, "requeueing via scontrol");
            let _ = tokio::process::Command::new("scontrol")
                .args(["requeue", job_id])
                .status()
                .await;
        }
    }
}

/// Generic LSF-family adapter (Summit shares this shape).
pub struct Lsf {
    pub cpus_per_node: u32,
    pub gpus_per_node: u32,
    pub budget: Option<WalltimeBudget>,
    pub job_id: Option<String>,
}

#[async_trait]
impl ClusterAdapter for Lsf {
    fn cpus_per_node(&self) -> u32 {
        self.cpus_per_node
    }
    fn gpus_per_node(&self) -> u32 {
        self.gpus_per_node
    }
    fn node_splittable(&self) -> bool {
        false
    }
    fn use_multiprocessing(&self) -> bool {
        false
    }
    fn in_queue(&self) -> bool {
        self.budget.is_some()
    }
    fn remaining(&self) -> Option<f64> {
        self.budget.map(|b| b.remaining())
    }
    fn mpiexec(&self, cmd: &str, nprocs: u32, cpus_per_proc: u32, gpus_per_proc: u32, _mps: Option<u32>) -> String {
        let mut parts = vec![format!("jsrun -n {nprocs} -c {cpus_per_proc}")];
        if gpus_per_proc > 0 {
            parts.push(format!("-g {gpus_per_proc}"));
        }
        parts.push(cmd.to_string());
        parts.join(" ")
    }
    async fn requeue(&self) {
        if let Some(job_id) = &self.job_id {
            tracing::info!(job_id, "requeueing via brequeue");
            let _ = tokio::process::Command::new("brequeue")
                .arg(job_id)
                .status()
                .await;
        }
    }

    fn submit_script_name(&self) -> &'static str {
        "job.bash"
    }

    fn render_submit_script(&self, cmd: &str, opts: &SubmitScriptOpts) -> String {
        let hh = (opts.walltime_minutes / 60.0) as u32;
        let mm = (opts.walltime_minutes - (hh * 60) as f64) as u32;
        let name = match (&opts.name, opts.dst_label.as_str()) {
            (Some(name), ".") => name.clone(),
            (Some(name), dst) => format!("{name}_{dst}"),
            (None, dst) => dst.to_string(),
        };

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#BSUB -J {name}"),
            format!("#BSUB -W {hh:02}:{mm:02}"),
            format!("#BSUB -nnodes {}", opts.nnodes),
            "#BSUB -o lsf.%J.o".to_string(),
            "#BSUB -e lsf.%J.e".to_string(),
            "#BSUB -alloc_flags \"gpumps\"".to_string(),
        ];
        if let Some(account) = &opts.account {
            lines.push(format!("#BSUB -P {account}"));
        }
        if opts.debug {
            lines.push("#BSUB -q debug".to_string());
        }
        lines.push(String::new());
        lines.push(format!("{cmd}\n"));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walltime_budget_counts_down() {
        let budget = WalltimeBudget {
            start: SystemTime::now() - std::time::Duration::from_secs(60),
            walltime_minutes: 10.0,
            gap_minutes: 1.0,
        };
        let remaining = budget.remaining();
        assert!((7.99..9.0).contains(&remaining));
    }

    #[test]
    fn local_adapter_is_never_in_queue() {
        let adapter = Local {
            cpus_per_node: 32,
            gpus_per_node: 0,
        };
        assert!(!adapter.in_queue());
        assert!(adapter.remaining().is_none());
    }

    #[test]
    fn slurm_mpiexec_includes_gpu_flag() {
        let adapter = Slurm {
            cpus_per_node: 32,
            gpus_per_node: 4,
            budget: None,
            job_id: None,
        };
        let cmd = adapter.mpiexec("./a.out", 4, 2, 1, None);
        assert!(cmd.contains("--gpus-per-task=1"));
        assert!(cmd.ends_with("./a.out"));
    }

    #[test]
    fn lsf_submit_script_includes_bsub_header() {
        let adapter = Lsf {
            cpus_per_node: 42,
            gpus_per_node: 6,
            budget: None,
            job_id: None,
        };
        let script = adapter.render_submit_script(
            "python -c \"from nnodes import root; root.run()\"",
            &SubmitScriptOpts {
                name: Some("myjob".to_string()),
                dst_label: ".".to_string(),
                nnodes: 4,
                walltime_minutes: 90.0,
                account: Some("acct1".to_string()),
                debug: false,
            },
        );
        assert!(script.contains("#BSUB -J myjob"));
        assert!(script.contains("#BSUB -W 01:30"));
        assert!(script.contains("#BSUB -P acct1"));
    }

    #[test]
    fn lsf_adapter_is_not_node_splittable() {
        let adapter = Lsf {
            cpus_per_node: 42,
            gpus_per_node: 6,
            budget: None,
            job_id: None,
        };
        assert!(!adapter.node_splittable());
    }
}
