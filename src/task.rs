//! Task representations.
//!
//! Python can pickle an arbitrary closure and hand it to a worker process
//! or restore it from a checkpoint written by a previous run. Rust can't:
//! a closure captured in one process has no stable name another process (or
//! a deserializer) can resolve. So every node task here is a [`TaskRef`] — a
//! plain, checkpoint-safe value naming either a shell command or a function
//! registered ahead of time under a `(module, symbol)` key — rather than an
//! arbitrary `Arc<dyn Fn>`. This is the same representation the dispatcher
//! already has to use for the MPI/multiprocessing sidecar payload, just
//! applied uniformly to every node instead of only to parallel ones. See
//! REDESIGN FLAGS.

use crate::error::NodeError;
use crate::node::Node;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

pub type TaskFn = Arc<dyn Fn(Arc<Node>) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

/// A node's task: either a shell command or a function resolved through the
/// process-wide [`registry`]. Both forms round-trip through a checkpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskRef {
    Import(String, String),
    Shell(String),
}

type Registry = HashMap<(String, String), TaskFn>;

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a callable under `(module, symbol)` so it can be referenced by
/// [`TaskRef::Import`] from workflow code, a checkpoint, or an MPI sidecar
/// payload. Call during process startup, before the tree is built.
pub fn register(module: &str, symbol: &str, f: TaskFn) {
    registry()
        .write()
        .unwrap()
        .insert((module.to_string(), symbol.to_string()), f);
}

pub fn resolve(module: &str, symbol: &str) -> Result<TaskFn, NodeError> {
    registry()
        .read()
        .unwrap()
        .get(&(module.to_string(), symbol.to_string()))
        .cloned()
        .ok_or_else(|| NodeError::UnknownTaskRef(module.to_string(), symbol.to_string()))
}

/// Default display name for a task, mirroring the original's `getname`: last
/// path segment of a shell command's first word, or the registered symbol.
pub fn default_name(task: &TaskRef) -> Option<String> {
    match task {
        TaskRef::Shell(cmd) => cmd
            .split(' ')
            .next()
            .and_then(|s| s.split('/').next_back())
            .map(|s| s.to_string()),
        TaskRef::Import(_, symbol) => Some(symbol.trim_start_matches('_').to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_strips_path_and_args_from_shell() {
        let t = TaskRef::Shell("./bin/run.sh --flag".to_string());
        assert_eq!(default_name(&t), Some("run.sh".to_string()));
    }

    #[test]
    fn default_name_strips_leading_underscore_from_import() {
        let t = TaskRef::Import("workflow".to_string(), "_helper".to_string());
        assert_eq!(default_name(&t), Some("helper".to_string()));
    }

    #[test]
    fn resolve_unknown_errors() {
        let result = resolve("nope", "nope");
        assert!(matches!(result, Err(NodeError::UnknownTaskRef(_, _))));
    }
}
