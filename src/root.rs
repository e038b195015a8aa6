//! Root node: job configuration, checkpoint persistence, signal-driven
//! requeue. Mirrors `root.py`'s `Root`/`Job` split — the root is a node like
//! any other, plus the shared context (`RootCtx`) every node in the tree
//! holds a reference to.

use crate::cluster::ClusterAdapter;
use crate::config::Config;
use crate::directory::Directory;
use crate::dispatcher::Dispatcher;
use crate::error::PersistError;
use crate::jobstate::JobState;
use crate::node::{Node, NodeState};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// State shared by every node in the tree: the cluster adapter, the
/// dispatcher, run flags, and the checkpoint/requeue machinery. Node holds
/// `Arc<RootCtx>` directly instead of walking to a `Root` ancestor, since
/// Rust has no equivalent of Python's "just subclass Node" trick for adding
/// job-global state to the tree root alone.
pub struct RootCtx {
    pub adapter: Arc<dyn ClusterAdapter>,
    pub dispatcher: Dispatcher,
    pub state: JobState,
    pub debug: bool,
    pub last_ping: AtomicI64,
    pub root_node: OnceLock<Weak<Node>>,
}

impl RootCtx {
    fn touch_ping(&self) {
        self.last_ping.store(now_epoch(), Ordering::SeqCst);
    }

    /// Seconds since the last checkpoint ping — the root's liveness signal
    /// that a node's status rendering degrades to "(not running)" past 70s.
    pub fn ping_age_secs(&self) -> i64 {
        now_epoch() - self.last_ping.load(Ordering::SeqCst)
    }

    /// Dump-then-atomic-rename checkpoint of the whole tree, skipped once
    /// the job has been handed off to a requeued successor.
    pub async fn save(&self) {
        if self.state.is_signaled() {
            return;
        }
        let Some(root) = self.root_node.get().and_then(Weak::upgrade) else {
            return;
        };
        self.touch_ping();
        root.set_init_ping(self.last_ping.load(Ordering::SeqCst));
        if let Err(e) = checkpoint_dump(&root).await {
            tracing::error!(error = %e, "failed to write checkpoint");
        }
    }

    /// Pause the job, checkpoint, then hand off to the cluster's requeue.
    pub async fn signal_requeue(&self) {
        if self.state.is_aborted() {
            return;
        }
        self.state.set_paused(true);
        self.save().await;
        self.state.set_signaled(true);
        self.adapter.requeue().await;
    }
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

async fn checkpoint_dump(root: &Arc<Node>) -> Result<(), PersistError> {
    let state = root.snapshot();
    // JSON, not bincode: `NodeState.init`/`data` (and `MpiRequestData.arg`/
    // `mpiarg`) are keyed by `Value`, a `#[serde(untagged)]` enum. bincode
    // isn't self-describing, so decoding an untagged enum routes through
    // `deserialize_any`, which bincode 1.3 rejects outright.
    root.dir().dump_json("_root.pickle", &state).await?;
    root.dir().mv("_root.pickle", &root.dir().root().join("root.pickle")).await
}

/// Owns the tree root and drives its top-level execution lifecycle: restore
/// or fresh init, alarm-based requeue-before-walltime-expiry, periodic
/// checkpoint ping, and post-execution auto-requeue.
pub struct Root {
    pub node: Arc<Node>,
    pub ctx: Arc<RootCtx>,
}

impl Root {
    /// Restore from `root.pickle` if present, else build fresh state from
    /// `config.toml`.
    pub async fn init(dir: Directory) -> Result<Self, crate::error::ConfigError> {
        if dir.has("root.pickle") {
            let state: NodeState = dir
                .load_json("root.pickle")
                .await
                .map_err(|e| crate::error::ConfigError::Read {
                    path: dir.root().join("root.pickle"),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                })?;
            let config: Config = dir.load_toml("config.toml").await.map_err(|e| {
                crate::error::ConfigError::Read {
                    path: dir.root().join("config.toml"),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
                }
            })?;
            let ctx = build_ctx(&config)?;
            let node = Node::restore(ctx.clone(), None, state);
            if let Some(ping) = node.init_ping() {
                ctx.last_ping.store(ping, Ordering::SeqCst);
            }
            ctx.root_node.set(Arc::downgrade(&node)).ok();
            return Ok(Root { node, ctx });
        }

        let config: Config = dir
            .load_toml("config.toml")
            .await
            .map_err(|e| crate::error::ConfigError::Read {
                path: dir.root().join("config.toml"),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            })?;
        let ctx = build_ctx(&config)?;
        let node = Node::new_root(dir, ctx.clone(), config.root.clone());
        let task_module = config.job.task.clone().unwrap_or_else(|| "main".to_string());
        node.set_task(Some(crate::task::TaskRef::Import(
            task_module,
            "main".to_string(),
        )));
        ctx.root_node.set(Arc::downgrade(&node)).ok();
        Ok(Root { node, ctx })
    }

    /// Run the tree to completion, arming a SIGALRM-equivalent
    /// requeue-before-walltime-expiry timer, a background checkpoint ping,
    /// and auto-requeuing on failure per the conditions in §4.5.
    pub async fn execute(self) {
        self.ctx.state.reset();

        let alarm_handle = if self.ctx.adapter.in_queue() {
            self.ctx.adapter.remaining().map(|remaining_min| {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs_f64((remaining_min * 60.0).max(0.0)))
                        .await;
                    if ctx.adapter.in_queue() && !ctx.state.is_aborted() {
                        ctx.signal_requeue().await;
                    }
                })
            })
        } else {
            None
        };

        let ping_handle = {
            let ctx = self.ctx.clone();
            let node = self.node.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    if node.done() {
                        break;
                    }
                    ctx.save().await;
                }
            })
        };

        self.node.clone().execute().await;

        ping_handle.abort();
        if let Some(h) = alarm_handle {
            h.abort();
        }

        if self.ctx.adapter.in_queue()
            && self.ctx.state.is_failed()
            && !self.ctx.state.is_aborted()
            && !self.ctx.debug
            && !self.ctx.state.is_paused()
            && self.ctx.adapter.allows_auto_requeue()
        {
            self.ctx.adapter.requeue().await;
        }
    }
}

fn build_ctx(config: &Config) -> Result<Arc<RootCtx>, crate::error::ConfigError> {
    let adapter = config.job.build_adapter()?;
    let dispatcher = Dispatcher::new(adapter.clone(), config.job.nnodes(), config.job.mp_nprocs_max);
    Ok(Arc::new(RootCtx {
        adapter,
        dispatcher,
        state: JobState::default(),
        debug: config.job.debug,
        last_ping: AtomicI64::new(now_epoch()),
        root_node: OnceLock::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_to_completion_from_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[root]
workflowname = "test"

[job]
system = "local"
nnodes = 1
walltime = 10
cpus_per_node = 4
gpus_per_node = 0
"#,
        )
        .unwrap();

        crate::task::register(
            "test_root_main",
            "main",
            std::sync::Arc::new(|node: std::sync::Arc<Node>| {
                Box::pin(async move {
                    node.set_concurrent(false);
                    Ok(())
                })
            }),
        );

        let dir = Directory::new(tmp.path());
        let root = Root::init(dir).await.unwrap();
        root.node.set_task(Some(crate::task::TaskRef::Import(
            "test_root_main".to_string(),
            "main".to_string(),
        )));
        let node = root.node.clone();
        root.execute().await;
        assert!(node.done());
    }

    /// Regression test for a checkpoint that round-trips a non-empty
    /// `[root]` table (always true in practice, since `config.root` seeds
    /// the root node's `init`): the written `root.pickle` must be loadable
    /// by a fresh process, and that process's liveness ping must come from
    /// the checkpoint rather than reset to "just started".
    #[tokio::test]
    async fn resumed_process_loads_checkpoint_and_inherits_ping() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
[root]
workflowname = "resume-test"
tags = ["a", "b"]

[job]
system = "local"
nnodes = 1
walltime = 10
cpus_per_node = 4
gpus_per_node = 0
"#,
        )
        .unwrap();

        let dir = Directory::new(tmp.path());
        let first = Root::init(dir).await.unwrap();
        first.node.set_task(Some(crate::task::TaskRef::Shell("true".to_string())));
        first.ctx.save().await;
        assert!(tmp.path().join("root.pickle").exists());
        let first_ping = first.ctx.last_ping.load(Ordering::SeqCst);

        // A fresh process picking the checkpoint back up (e.g. after requeue).
        let dir = Directory::new(tmp.path());
        let resumed = Root::init(dir)
            .await
            .expect("restoring a checkpoint with non-empty root attributes must not error");

        assert_eq!(
            resumed
                .node
                .get("workflowname")
                .and_then(|v| v.as_str().map(String::from)),
            Some("resume-test".to_string())
        );
        assert_eq!(resumed.ctx.last_ping.load(Ordering::SeqCst), first_ping);
    }
}
