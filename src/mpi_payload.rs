//! Serializable payload handed from the dispatcher to the MPI/multiprocessing
//! sidecar binary, mirroring `mpiexec.py`'s `d.dump((task, args, mpiarg,
//! group_mpiarg), f'{fname}.pickle')` / `mpi.py`'s unpacking of it.

use crate::task::TaskRef;
use crate::value::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiPayload {
    pub task: TaskRef,
    /// Fixed argument passed to every rank.
    pub arg: Option<Value>,
    /// Per-rank argument chunks, already split by `Dispatcher::fan_out`.
    pub arg_mpi: Option<Vec<Vec<Value>>>,
}

/// Checkpoint-safe timeout configuration for an `add_mpi` request (no
/// closures, unlike `dispatcher::Timeout`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub enum TimeoutSpec {
    None,
    #[default]
    Auto,
    Minutes(f64),
}

/// Configuration for a node's MPI/multiprocessing dispatch, stored
/// separately from the node's own `task` so it round-trips through a
/// checkpoint (see [`crate::node::NodeState`]). Post-admission hooks
/// (`check_output`/`on_timeout`) are intentionally not representable here —
/// they're an in-process-only convenience of `Dispatcher::mpiexec` used
/// directly, not of this tree-level wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiRequestData {
    pub task: TaskRef,
    pub nprocs: u32,
    pub cpus_per_proc: u32,
    pub gpus_per_proc: u32,
    pub mps: Option<u32>,
    pub fname: Option<String>,
    pub arg: Option<Value>,
    pub mpiarg: Option<Vec<Value>>,
    pub group_mpiarg: bool,
    pub use_multiprocessing: Option<bool>,
    pub timeout: TimeoutSpec,
    pub priority: i32,
}
