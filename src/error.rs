//! Error types for the orchestrator.
//!
//! Each subsystem gets its own `thiserror` enum, mirroring the one-enum-per-concern
//! convention the rest of this codebase uses for parse/runtime errors.

use std::path::PathBuf;

/// Errors raised while a task body is running or retried.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("task failed: {0}")]
    Task(String),

    #[error("unknown task reference ({0}, {1})")]
    UnknownTaskRef(String, String),

    #[error(transparent)]
    Dispatch(#[from] DispatcherError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Distinguished error: the allocation is about to run out of walltime.
    /// Caught by the node executor, which routes it to the root's signal path
    /// instead of marking the node failed.
    #[error("insufficient walltime remaining")]
    InsufficientWalltime,
}

/// Errors raised by the MPI/multiprocessing dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("nprocs ({nprocs}) is not a multiple of mps ({mps})")]
    MpsMismatch { nprocs: u32, mps: u32 },

    #[error("command `{cmd}` exited with status {code}")]
    NonZeroExit { cmd: String, code: i32 },

    #[error("task output rejected: {0}")]
    OutputRejected(String),

    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Distinguished: the timeout came from "remaining walltime", so the node
    /// executor should treat this like `NodeError::InsufficientWalltime`.
    #[error("insufficient walltime remaining")]
    InsufficientWalltime,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while checkpointing or restoring tree state.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("failed to encode: {0}")]
    Encode(String),
}

/// Errors raised while reading `config.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown cluster adapter: {0}")]
    UnknownAdapter(String),
}
