//! `config.toml` parsing: the `[root]` and `[job]` tables that seed a fresh
//! (non-resumed) root node, matching `root.py::init`'s config path and
//! `job.py::Job.__init__`'s required/optional field set.

use crate::cluster::{ClusterAdapter, Local, LocalMpi, Lsf, Slurm, WalltimeBudget};
use crate::error::ConfigError;
use crate::value::Value;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub root: HashMap<String, Value>,
    pub job: JobConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub system: String,
    pub nnodes: u32,
    pub walltime: f64,
    pub cpus_per_node: u32,
    pub gpus_per_node: u32,
    pub name: Option<String>,
    pub account: Option<String>,
    /// Module providing the root node's `main` task, e.g. `"workflow"` for a
    /// sibling `workflow.py`-equivalent registered under that name. Falls
    /// back to `"main"` when the workflow registers its entry point there
    /// directly; distinct from `system`, which only names the cluster
    /// adapter.
    pub task: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub gap: f64,
    #[serde(default)]
    pub node_splittable: Option<bool>,
    #[serde(default)]
    pub use_multiprocessing: bool,
    #[serde(default = "default_mp_nprocs_max")]
    pub mp_nprocs_max: u32,
    pub job_id_env: Option<String>,
}

fn default_mp_nprocs_max() -> u32 {
    20
}

impl JobConfig {
    pub fn nnodes(&self) -> f64 {
        self.nnodes as f64
    }

    fn job_id(&self) -> Option<String> {
        self.job_id_env
            .as_ref()
            .and_then(|var| env::var(var).ok())
    }

    fn budget(&self) -> Option<WalltimeBudget> {
        self.job_id().map(|_| WalltimeBudget {
            start: SystemTime::now(),
            walltime_minutes: self.walltime,
            gap_minutes: self.gap,
        })
    }

    /// Build the concrete cluster adapter named by `system`: `local`,
    /// `local-mpi`, `slurm`, or `lsf`. The per-site subclasses the original
    /// ships (Tiger/Traverse/DTN/Summit) collapse into `slurm`/`lsf` plus
    /// the `cpus_per_node`/`gpus_per_node` already read from this table.
    pub fn build_adapter(&self) -> Result<Arc<dyn ClusterAdapter>, ConfigError> {
        match self.system.as_str() {
            "local" => Ok(Arc::new(Local {
                cpus_per_node: self.cpus_per_node,
                gpus_per_node: self.gpus_per_node,
            })),
            "local-mpi" => Ok(Arc::new(LocalMpi {
                cpus_per_node: self.cpus_per_node,
            })),
            "slurm" => Ok(Arc::new(Slurm {
                cpus_per_node: self.cpus_per_node,
                gpus_per_node: self.gpus_per_node,
                budget: self.budget(),
                job_id: self.job_id(),
            })),
            "lsf" => Ok(Arc::new(Lsf {
                cpus_per_node: self.cpus_per_node,
                gpus_per_node: self.gpus_per_node,
                budget: self.budget(),
                job_id: self.job_id(),
            })),
            other => Err(ConfigError::UnknownAdapter(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
[root]
workflowname = "demo"

[job]
system = "local"
nnodes = 2
walltime = 60
cpus_per_node = 32
gpus_per_node = 4
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.job.mp_nprocs_max, 20);
        assert_eq!(
            config.root.get("workflowname").and_then(|v| v.as_str()),
            Some("demo")
        );
    }

    #[test]
    fn unknown_adapter_errors() {
        let job = JobConfig {
            system: "made-up".to_string(),
            nnodes: 1,
            walltime: 1.0,
            cpus_per_node: 1,
            gpus_per_node: 0,
            name: None,
            account: None,
            task: None,
            debug: false,
            gap: 0.0,
            node_splittable: None,
            use_multiprocessing: false,
            mp_nprocs_max: 20,
            job_id_env: None,
        };
        assert!(matches!(job.build_adapter(), Err(ConfigError::UnknownAdapter(_))));
    }
}
