//! The node tree: a directory with a task, executed depth-first with
//! sequential-or-concurrent children.
//!
//! Mirrors `node.py`'s state machine closely — attribute inheritance through
//! `data` -> `init` -> parent, the idempotent `execute()` entrypoint, the
//! `(running - H:MM:SS)` / `(not running)` status rendering driven by the
//! root's last checkpoint ping — but with a checkpoint-safe [`TaskRef`]
//! instead of a pickled closure, and `Arc`/`Weak` instead of a cyclic
//! reference graph a GC can collect.

use crate::directory::Directory;
use crate::dispatcher::{CheckOutput, MpiExecRequest, OnTimeout, Timeout};
use crate::error::{DispatcherError, NodeError};
use crate::mpi_payload::{MpiPayload, MpiRequestData, TimeoutSpec};
use crate::root::RootCtx;
use crate::task::{self, TaskRef};
use crate::value::Value;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Fields resolved directly on a node rather than walked up to the parent.
const RESERVED: &[&str] = &["task", "args", "concurrent", "prober", "name", "retry"];

pub type ProberFn = Arc<dyn Fn(&Arc<Node>) -> Option<Value> + Send + Sync>;

#[derive(Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeState {
    pub name: Option<String>,
    pub data: HashMap<String, Value>,
    pub init: HashMap<String, Value>,
    pub task: Option<TaskRef>,
    pub args: Option<Vec<Value>>,
    pub concurrent: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub dispatch_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_mpi: bool,
    pub err: Option<String>,
    pub cwd: PathBuf,
    pub mpi_request: Option<MpiRequestData>,
    pub children: Vec<NodeState>,
}

pub struct Node {
    dir: Directory,
    ctx: Arc<RootCtx>,
    parent: Option<Weak<Node>>,
    name_override: RwLock<Option<String>>,
    init: RwLock<HashMap<String, Value>>,
    data: RwLock<HashMap<String, Value>>,
    children: RwLock<Vec<Arc<Node>>>,
    task: RwLock<Option<TaskRef>>,
    args: RwLock<Option<Vec<Value>>>,
    concurrent: RwLock<Option<bool>>,
    prober: RwLock<Option<ProberFn>>,
    start_time: RwLock<Option<DateTime<Utc>>>,
    dispatch_time: RwLock<Option<DateTime<Utc>>>,
    end_time: RwLock<Option<DateTime<Utc>>>,
    is_mpi: AtomicBool,
    err: RwLock<Option<String>>,
    mpi_request: RwLock<Option<MpiRequestData>>,
}

/// Per-`add` options, grouped because Rust has no keyword arguments.
#[derive(Default)]
pub struct AddOptions {
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub args: Option<Vec<Value>>,
    pub concurrent: Option<bool>,
    pub prober: Option<ProberFn>,
    pub data: HashMap<String, Value>,
}

impl Node {
    pub fn new_root(dir: Directory, ctx: Arc<RootCtx>, init: HashMap<String, Value>) -> Arc<Node> {
        Arc::new(Node {
            dir,
            ctx,
            parent: None,
            name_override: RwLock::new(None),
            init: RwLock::new(init),
            data: RwLock::new(HashMap::new()),
            children: RwLock::new(Vec::new()),
            task: RwLock::new(None),
            args: RwLock::new(None),
            concurrent: RwLock::new(None),
            prober: RwLock::new(None),
            start_time: RwLock::new(None),
            dispatch_time: RwLock::new(None),
            end_time: RwLock::new(None),
            is_mpi: AtomicBool::new(false),
            err: RwLock::new(None),
            mpi_request: RwLock::new(None),
        })
    }

    pub fn dir(&self) -> &Directory {
        &self.dir
    }

    pub fn ctx(&self) -> &Arc<RootCtx> {
        &self.ctx
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn depth(&self) -> usize {
        match self.parent() {
            Some(p) => 1 + p.depth(),
            None => 0,
        }
    }

    pub fn is_mpi(&self) -> bool {
        self.is_mpi.load(Ordering::SeqCst)
    }

    pub fn err(&self) -> Option<String> {
        self.err.read().unwrap().clone()
    }

    pub fn task(&self) -> Option<TaskRef> {
        self.task.read().unwrap().clone()
    }

    pub fn set_task(&self, task: Option<TaskRef>) {
        *self.task.write().unwrap() = task;
    }

    pub fn args(&self) -> Option<Vec<Value>> {
        self.args.read().unwrap().clone()
    }

    pub fn set_args(&self, args: Option<Vec<Value>>) {
        *self.args.write().unwrap() = args;
    }

    pub fn concurrent(&self) -> bool {
        self.concurrent.read().unwrap().unwrap_or(false)
    }

    pub fn set_concurrent(&self, v: bool) {
        *self.concurrent.write().unwrap() = Some(v);
    }

    /// Attribute lookup: own `data`, then own `init`, then (unless `key` is a
    /// reserved field) the parent's resolution chain.
    pub fn get(self: &Arc<Self>, key: &str) -> Option<Value> {
        if let Some(v) = self.data.read().unwrap().get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.init.read().unwrap().get(key) {
            return Some(v.clone());
        }
        if !RESERVED.contains(&key) {
            if let Some(parent) = self.parent() {
                return parent.get(key);
            }
        }
        None
    }

    pub fn set(&self, key: &str, val: impl Into<Value>) {
        self.data.write().unwrap().insert(key.to_string(), val.into());
    }

    /// Attribute lookup restricted to this node's own `data`/`init` — no
    /// walk to the parent even for keys outside `RESERVED`. Used for
    /// `RESERVED` keys, where the usual inheritance chain is blocked.
    fn own_attr(&self, key: &str) -> Option<Value> {
        if let Some(v) = self.data.read().unwrap().get(key) {
            return Some(v.clone());
        }
        self.init.read().unwrap().get(key).cloned()
    }

    /// Persist the last checkpoint ping into `init` so a fresh process
    /// reading a restored checkpoint's `root.pickle` can seed its liveness
    /// clock instead of assuming "just started". Mirrors the original
    /// stashing the ping in `_init['_ping']`, which rides along in the
    /// pickled state.
    pub(crate) fn set_init_ping(&self, epoch_secs: i64) {
        self.init
            .write()
            .unwrap()
            .insert("_ping".to_string(), Value::Int(epoch_secs));
    }

    pub(crate) fn init_ping(&self) -> Option<i64> {
        self.own_attr("_ping").and_then(|v| v.as_f64()).map(|f| f as i64)
    }

    /// Retry budget: this node's own `retry`, else the root's `defaultRetry`,
    /// else 0. `retry` is reserved so `get` never walks to the parent for
    /// it — the root-level default has to be consulted explicitly instead.
    fn retry_budget(self: &Arc<Self>) -> u32 {
        self.own_attr("retry")
            .or_else(|| {
                self.ctx
                    .root_node
                    .get()
                    .and_then(Weak::upgrade)
                    .and_then(|root| root.own_attr("defaultRetry"))
            })
            .and_then(|v| v.as_f64())
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    /// Delay between retry attempts, resolved like any ordinary (non-reserved)
    /// attribute — it inherits from the parent chain, so a root-level
    /// `retryDelay` already applies without special-casing.
    fn retry_delay(self: &Arc<Self>) -> Duration {
        self.get("retryDelay")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(1))
    }

    /// Node name: explicit override, else derived from the task, else the
    /// directory's own basename.
    pub fn name(self: &Arc<Self>) -> String {
        if let Some(n) = self.name_override.read().unwrap().clone() {
            return n;
        }
        if let Some(task) = self.task().as_ref() {
            if let Some(n) = task::default_name(task) {
                return n;
            }
        }
        self.dir
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether this node's task and every descendant's task has completed.
    pub fn done(&self) -> bool {
        if self.end_time.read().unwrap().is_some() {
            self.children.read().unwrap().iter().all(|c| c.done())
        } else {
            false
        }
    }

    /// Total walltime, once `done`.
    pub fn elapsed(&self) -> Option<f64> {
        if !self.done() {
            return None;
        }
        let end = (*self.end_time.read().unwrap())?;
        let base = *self.dispatch_time.read().unwrap();
        let start = base.or(*self.start_time.read().unwrap())?;
        let own = (end - start).num_milliseconds() as f64 / 1000.0;

        let children = self.children.read().unwrap();
        let child_elapsed: Vec<f64> = children.iter().filter_map(|c| c.elapsed()).collect();
        if child_elapsed.is_empty() {
            return Some(own);
        }
        if self.concurrent() && child_elapsed.len() > 1 {
            Some(own + child_elapsed.iter().cloned().fold(0.0, f64::max))
        } else {
            Some(own + child_elapsed.iter().sum::<f64>())
        }
    }

    /// Status-annotated display name, mirroring `node.py.__str__`.
    pub fn display_name(self: &Arc<Self>) -> String {
        let mut name = self.name();

        if self.err.read().unwrap().is_some() {
            name.push_str(" (failed)");
            return name;
        }

        let start = *self.start_time.read().unwrap();
        let Some(start) = start else {
            return name;
        };

        if self.done() {
            if let Some(elapsed) = self.elapsed() {
                name.push_str(&format!(" ({})", format_hms(elapsed)));
            }
            return name;
        }

        if self.ctx.state.is_paused() {
            name.push_str(" (terminated)");
            return name;
        }

        let dispatch_time = *self.dispatch_time.read().unwrap();
        if self.is_mpi() && dispatch_time.is_none() {
            name.push_str(" (pending)");
            return name;
        }

        if let Some(prober) = self.prober.read().unwrap().clone() {
            if let Some(state) = prober(self) {
                match state {
                    Value::Float(f) => name.push_str(&format!(" ({}%)", (f * 100.0) as i64)),
                    other => {
                        if let Some(s) = other.as_str() {
                            name.push_str(&format!(" ({s})"));
                        }
                    }
                }
                return name;
            }
        }

        let ping_age = self.ctx.ping_age_secs();
        if ping_age > 70 {
            name.push_str(" (not running)");
        } else {
            let since = dispatch_time.unwrap_or(start);
            let elapsed = (Utc::now() - since).num_milliseconds() as f64 / 1000.0;
            name.push_str(&format!(" (running - {})", format_hms(elapsed)));
        }

        name
    }

    /// Structure and execution status, collapsing finished siblings onto one
    /// line unless `verbose`.
    pub fn stat(self: &Arc<Self>, verbose: bool) -> String {
        let mut out = self.display_name();
        if !verbose {
            out = out.split(' ').next().unwrap_or(&out).to_string();
        }

        let children = self.children.read().unwrap().clone();
        let width = children.len().saturating_sub(1).to_string().len();
        let mut collapsed = false;

        for (i, child) in children.iter().enumerate() {
            out.push('\n');
            if self.concurrent() {
                out.push_str("- ");
            } else {
                out.push_str(&format!("{:0>width$}) ", i, width = width));
            }

            let child_running = child.start_time.read().unwrap().is_some();
            if !verbose && (child.done() || (collapsed && !child_running)) {
                out.push_str(&child.display_name());
            } else {
                collapsed = true;
                if !child.children.read().unwrap().is_empty() {
                    out.push_str(&child.stat(verbose).replace('\n', "\n  "));
                } else {
                    out.push_str(&child.display_name());
                }
            }
        }

        out
    }

    /// Add a child node.
    pub fn add(self: &Arc<Self>, task: Option<TaskRef>, opts: AddOptions) -> Arc<Node> {
        let cwd = opts.cwd.clone().unwrap_or_else(|| ".".to_string());
        let dir = Directory::new(self.dir.path(&[&cwd], false));

        let init = opts.data;

        let child = Arc::new(Node {
            dir,
            ctx: self.ctx.clone(),
            parent: Some(Arc::downgrade(self)),
            name_override: RwLock::new(None),
            init: RwLock::new(init),
            data: RwLock::new(HashMap::new()),
            children: RwLock::new(Vec::new()),
            task: RwLock::new(task),
            args: RwLock::new(opts.args),
            concurrent: RwLock::new(opts.concurrent),
            prober: RwLock::new(opts.prober),
            start_time: RwLock::new(None),
            dispatch_time: RwLock::new(None),
            end_time: RwLock::new(None),
            is_mpi: AtomicBool::new(false),
            err: RwLock::new(None),
            mpi_request: RwLock::new(None),
        });

        if let Some(name) = opts.name.or(opts.cwd) {
            *child.name_override.write().unwrap() = Some(name);
        }

        self.children.write().unwrap().push(child.clone());
        child
    }

    pub fn mark_mpi(&self, dispatch_time: Option<DateTime<Utc>>) {
        self.is_mpi.store(true, Ordering::SeqCst);
        *self.dispatch_time.write().unwrap() = dispatch_time;
    }

    /// Add an MPI/multiprocessing child, dispatched through the shared
    /// `Dispatcher` rather than run in-process. Mirrors `node.py::add_mpi`.
    pub fn add_mpi(self: &Arc<Self>, req: MpiRequestData, opts: AddOptions) -> Arc<Node> {
        let default_name = req
            .fname
            .clone()
            .or_else(|| task::default_name(&req.task))
            .unwrap_or_else(|| "mpiexec".to_string());
        let mut opts = opts;
        opts.name.get_or_insert(default_name);
        let child = self.add(None, opts);
        child.is_mpi.store(true, Ordering::SeqCst);
        *child.mpi_request.write().unwrap() = Some(req);
        child
    }

    /// Reset this node and its children to a freshly-constructed state.
    pub fn reset(&self) {
        *self.start_time.write().unwrap() = None;
        *self.dispatch_time.write().unwrap() = None;
        *self.end_time.write().unwrap() = None;
        *self.err.write().unwrap() = None;
        self.data.write().unwrap().clear();
        self.children.write().unwrap().clear();
    }

    /// Recursive checkpoint snapshot. Only checkpoint-safe state survives —
    /// in-process `prober` closures don't, matching the original's pickle
    /// restriction to module-level callables.
    pub fn snapshot(&self) -> NodeState {
        NodeState {
            name: self.name_override.read().unwrap().clone(),
            data: self.data.read().unwrap().clone(),
            init: self.init.read().unwrap().clone(),
            task: self.task.read().unwrap().clone(),
            args: self.args.read().unwrap().clone(),
            concurrent: *self.concurrent.read().unwrap(),
            start_time: *self.start_time.read().unwrap(),
            dispatch_time: *self.dispatch_time.read().unwrap(),
            end_time: *self.end_time.read().unwrap(),
            is_mpi: self.is_mpi(),
            err: self.err.read().unwrap().clone(),
            cwd: self.dir.root().to_path_buf(),
            mpi_request: self.mpi_request.read().unwrap().clone(),
            children: self
                .children
                .read()
                .unwrap()
                .iter()
                .map(|c| c.snapshot())
                .collect(),
        }
    }

    /// Rebuild a node (and its descendants) from a checkpoint snapshot.
    /// Children are created fresh (not re-added by task code), matching the
    /// original's full-tree pickle restore.
    pub fn restore(ctx: Arc<RootCtx>, parent: Option<&Arc<Node>>, state: NodeState) -> Arc<Node> {
        let node = Arc::new(Node {
            dir: Directory::new(state.cwd),
            ctx,
            parent: parent.map(Arc::downgrade),
            name_override: RwLock::new(state.name),
            init: RwLock::new(state.init),
            data: RwLock::new(state.data),
            children: RwLock::new(Vec::new()),
            task: RwLock::new(state.task),
            args: RwLock::new(state.args),
            concurrent: RwLock::new(state.concurrent),
            prober: RwLock::new(None),
            start_time: RwLock::new(state.start_time),
            dispatch_time: RwLock::new(state.dispatch_time),
            end_time: RwLock::new(state.end_time),
            is_mpi: AtomicBool::new(state.is_mpi),
            err: RwLock::new(state.err),
            mpi_request: RwLock::new(state.mpi_request),
        });

        let children: Vec<Arc<Node>> = state
            .children
            .into_iter()
            .map(|c| Node::restore(node.ctx.clone(), Some(&node), c))
            .collect();
        *node.children.write().unwrap() = children;

        node
    }

    /// Execute this node's task, then its children. Idempotent: a no-op if
    /// the task already completed (checkpoint resume).
    pub fn execute(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.clone().exec_task().await;
            self.exec_children().await;
        })
    }

    async fn run_once(self: &Arc<Self>) -> Result<(), NodeError> {
        let req = self.mpi_request.read().unwrap().clone();
        if let Some(req) = req {
            return self.run_mpi(req).await;
        }

        let task = self.task();
        let Some(task) = task else { return Ok(()) };

        match task {
            TaskRef::Shell(cmd) => {
                let stdout = self.dir.root().join(format!("{}.stdout", self.name()));
                let stderr = self.dir.root().join(format!("{}.stderr", self.name()));
                let status = self
                    .dir
                    .call_async(&cmd, Some(&stdout), Some(&stderr))
                    .await
                    .map_err(|e| NodeError::Task(e.to_string()))?;
                if !status.success() {
                    return Err(NodeError::Task(format!(
                        "`{cmd}` exited with {:?}",
                        status.code()
                    )));
                }
                Ok(())
            }
            TaskRef::Import(module, symbol) => {
                let f = task::resolve(&module, &symbol)?;
                f(self.clone()).await
            }
        }
    }

    /// Dispatch an `add_mpi` node through the admission-controlled
    /// dispatcher. The task and its arguments travel to the sidecar process
    /// as an [`MpiPayload`] file, since a resolved `TaskRef::Import` can't be
    /// handed to a child process any other way (mirrors `mpiexec.py` pickling
    /// `(task, args, mpiarg, group_mpiarg)` to `{fname}.pickle`).
    async fn run_mpi(self: &Arc<Self>, req: MpiRequestData) -> Result<(), NodeError> {
        let fname = crate::dispatcher::unique_stem(
            self.dir.root(),
            &req.fname.clone().unwrap_or_else(|| self.name()),
        );
        let use_multiprocessing = req.use_multiprocessing.unwrap_or(false);

        // A plain shell command with no multiprocessing fan-out needs no
        // sidecar at all: it can be handed straight to the cluster's
        // `mpiexec` wrapper, same as `mpiexec.py`'s `if not callable(task)`
        // branch. Only a resolved task or a multiprocessing fan-out goes
        // through the pickled-payload sidecar.
        let (nprocs, cmd, mpiarg_strings) = if let TaskRef::Shell(shell_cmd) = &req.task {
            if !use_multiprocessing {
                (req.nprocs, shell_cmd.clone(), None)
            } else {
                self.build_sidecar_dispatch(&req, &fname).await?
            }
        } else {
            self.build_sidecar_dispatch(&req, &fname).await?
        };

        let timeout = match req.timeout {
            TimeoutSpec::None => Timeout::None,
            TimeoutSpec::Auto => Timeout::Auto,
            TimeoutSpec::Minutes(m) => Timeout::Minutes(m),
        };

        self.ctx
            .dispatcher
            .mpiexec(MpiExecRequest {
                cmd,
                nprocs,
                cpus_per_proc: req.cpus_per_proc,
                gpus_per_proc: req.gpus_per_proc,
                mps: req.mps,
                fname,
                mpiarg: mpiarg_strings,
                group_mpiarg: req.group_mpiarg,
                check_output: CheckOutput::None,
                use_multiprocessing: req.use_multiprocessing.unwrap_or(false),
                timeout,
                on_timeout: OnTimeout::Raise,
                priority: req.priority,
                dir: self.dir.root(),
            })
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?;

        Ok(())
    }

    /// Dumps `req`'s task/args/fan-out to `{fname}.payload.json` and builds
    /// the sidecar invocation command. Returns `(nprocs, cmd, mpiarg)`.
    async fn build_sidecar_dispatch(
        self: &Arc<Self>,
        req: &MpiRequestData,
        fname: &str,
    ) -> Result<(u32, String, Option<Vec<String>>), NodeError> {
        let (nprocs, arg_mpi, mpiarg_strings) = if let Some(items) = req.mpiarg.clone() {
            let serialized: Vec<String> = items
                .iter()
                .map(|v| serde_json::to_string(v).unwrap_or_default())
                .collect();
            let (nprocs, chunks) = crate::dispatcher::Dispatcher::fan_out(serialized, req.nprocs);
            let arg_mpi: Vec<Vec<Value>> = chunks
                .iter()
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|s| serde_json::from_str(s).unwrap_or(Value::Str(String::new())))
                        .collect()
                })
                .collect();
            let flat: Vec<String> = chunks.into_iter().flatten().collect();
            (nprocs, Some(arg_mpi), Some(flat))
        } else {
            (req.nprocs, None, None)
        };

        let payload = MpiPayload {
            task: req.task.clone(),
            arg: req.arg.clone(),
            arg_mpi,
        };
        self.dir
            .dump_json(&format!("{fname}.payload.json"), &payload)
            .await
            .map_err(|e| NodeError::Task(e.to_string()))?;

        let sidecar = sidecar_binary_path()?;
        let cmd = format!("{} {fname}", sidecar.display());
        Ok((nprocs, cmd, mpiarg_strings))
    }

    async fn exec_task(self: Arc<Self>) {
        if self.end_time.read().unwrap().is_some() {
            return;
        }

        if let Err(e) = self.dir.mkdir().await {
            tracing::error!(error = %e, node = %self.name(), "failed to create node directory");
        }

        let had_prior_err = self.err.read().unwrap().is_some();

        *self.start_time.write().unwrap() = Some(Utc::now());
        *self.dispatch_time.write().unwrap() = None;
        *self.end_time.write().unwrap() = None;
        *self.err.write().unwrap() = None;
        self.data.write().unwrap().clear();
        self.ctx.save().await;

        println!("{}{}", "  ".repeat(self.depth()), self.name());

        let max_retry = self.retry_budget();
        let mut attempt = 0;
        let result = loop {
            match self.run_once().await {
                Ok(()) => break Ok(()),
                Err(e) if is_walltime_error(&e) => break Err(e),
                Err(_e) if attempt < max_retry => {
                    attempt += 1;
                    println!("{}  ... (retry {attempt})", "  ".repeat(self.depth()));
                    tokio::time::sleep(self.retry_delay()).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(()) => {
                *self.end_time.write().unwrap() = Some(Utc::now());
            }
            Err(e) => {
                tracing::warn!(error = %e, node = %self.name(), "node task failed");
                *self.start_time.write().unwrap() = None;
                *self.dispatch_time.write().unwrap() = None;
                *self.err.write().unwrap() = Some(e.to_string());

                if is_walltime_error(&e) {
                    self.ctx.signal_requeue().await;
                } else if had_prior_err || self.ctx.debug {
                    self.ctx.state.set_aborted(true);
                } else {
                    self.ctx.state.set_failed(true);
                }
            }
        }

        self.ctx.save().await;
    }

    /// Execute unfinished children: concurrently (barrier per round) or one
    /// at a time. A node that adds new children from within a task only
    /// picks them up on the *next* round, matching the original's
    /// re-scan-after-gather behavior rather than mid-batch injection.
    async fn exec_children(self: Arc<Self>) {
        if self.end_time.read().unwrap().is_none() {
            return;
        }

        let mut excluded: Vec<Arc<Node>> = Vec::new();

        loop {
            let unfinished: Vec<Arc<Node>> = self
                .children
                .read()
                .unwrap()
                .iter()
                .filter(|n| !excluded.iter().any(|e| Arc::ptr_eq(e, n)) && !n.done())
                .cloned()
                .collect();

            if unfinished.is_empty() {
                break;
            }

            if self.concurrent() {
                excluded.extend(unfinished.iter().cloned());
                let futures = unfinished.into_iter().map(|n| n.execute());
                futures::future::join_all(futures).await;
            } else {
                let first = unfinished[0].clone();
                excluded.push(first.clone());
                first.execute().await;
            }

            if self.ctx.state.is_failed() || self.ctx.state.is_aborted() {
                break;
            }
        }
    }
}

/// Locates the `nnodes-mpi` sidecar binary next to the running executable.
/// `cargo test` harness binaries live one level deeper (under `deps/`) than
/// the binary targets they're built alongside, so the parent's parent is
/// tried as a fallback.
fn sidecar_binary_path() -> Result<PathBuf, NodeError> {
    let exe = std::env::current_exe().map_err(|e| NodeError::Task(e.to_string()))?;
    let candidates = [
        exe.parent().map(|d| d.join("nnodes-mpi")),
        exe.parent()
            .and_then(|d| d.parent())
            .map(|d| d.join("nnodes-mpi")),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|p| p.exists())
        .ok_or_else(|| NodeError::Task("could not locate nnodes-mpi sidecar binary".to_string()))
}

fn is_walltime_error(e: &NodeError) -> bool {
    matches!(
        e,
        NodeError::InsufficientWalltime | NodeError::Dispatch(DispatcherError::InsufficientWalltime)
    )
}

fn format_hms(seconds: f64) -> String {
    let total = seconds.round().max(0.0) as i64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Local;
    use crate::dispatcher::Dispatcher;
    use crate::jobstate::JobState;
    use std::sync::atomic::AtomicI64;

    fn test_ctx() -> Arc<RootCtx> {
        let adapter = Arc::new(Local {
            cpus_per_node: 4,
            gpus_per_node: 0,
        });
        Arc::new(RootCtx {
            adapter: adapter.clone(),
            dispatcher: Dispatcher::new(adapter, 1.0, 8),
            state: JobState::default(),
            debug: false,
            last_ping: AtomicI64::new(0),
            root_node: std::sync::OnceLock::new(),
        })
    }

    #[tokio::test]
    async fn shell_task_completes_and_marks_done() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx, HashMap::new());
        root.set_task(Some(TaskRef::Shell("true".to_string())));
        root.clone().execute().await;
        assert!(root.done());
    }

    #[tokio::test]
    async fn failing_shell_task_sets_job_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx.clone(), HashMap::new());
        root.set_task(Some(TaskRef::Shell("false".to_string())));
        root.clone().execute().await;
        assert!(!root.done());
        assert!(ctx.state.is_failed());
    }

    #[tokio::test]
    async fn second_consecutive_failure_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx.clone(), HashMap::new());
        root.set_task(Some(TaskRef::Shell("false".to_string())));
        root.clone().execute().await;
        assert!(ctx.state.is_failed());
        root.clone().execute().await;
        assert!(ctx.state.is_aborted());
    }

    #[tokio::test]
    async fn attribute_lookup_walks_to_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let mut init = HashMap::new();
        init.insert("greeting".to_string(), Value::Str("hi".to_string()));
        let root = Node::new_root(Directory::new(tmp.path()), ctx, init);
        let child = root.add(None, AddOptions::default());
        assert_eq!(child.get("greeting").and_then(|v| v.as_str().map(String::from)), Some("hi".to_string()));
    }

    #[tokio::test]
    async fn retry_falls_back_to_root_default_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let mut init = HashMap::new();
        init.insert("defaultRetry".to_string(), Value::Int(2));
        init.insert("retryDelay".to_string(), Value::Float(0.001));
        let root = Node::new_root(Directory::new(tmp.path()), ctx.clone(), init);
        ctx.root_node.set(Arc::downgrade(&root)).ok();

        let counter = tmp.path().join("attempts.txt");
        let child = root.add(
            Some(TaskRef::Shell(format!("echo x >> {} && false", counter.display()))),
            AddOptions::default(),
        );
        root.clone().execute().await;

        let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
        assert_eq!(attempts, 3); // 1 initial attempt + 2 retries from root-level defaultRetry
        assert!(child.err().is_some());
        assert!(ctx.state.is_failed());
    }

    #[tokio::test]
    async fn sequential_children_run_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx, HashMap::new());
        root.set_task(Some(TaskRef::Shell("true".to_string())));
        let log = tmp.path().join("order.txt");
        root.add(
            Some(TaskRef::Shell(format!("echo a >> {}", log.display()))),
            AddOptions::default(),
        );
        root.add(
            Some(TaskRef::Shell(format!("echo b >> {}", log.display()))),
            AddOptions::default(),
        );
        root.clone().execute().await;
        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn format_hms_strips_hour_when_zero() {
        assert_eq!(format_hms(90.0), "01:30");
        assert_eq!(format_hms(3661.0), "1:01:01");
    }

    fn mpi_test_ctx() -> Arc<RootCtx> {
        let adapter = Arc::new(crate::cluster::LocalMpi { cpus_per_node: 4 });
        Arc::new(RootCtx {
            adapter: adapter.clone(),
            dispatcher: Dispatcher::new(adapter, 1.0, 8),
            state: JobState::default(),
            debug: false,
            last_ping: AtomicI64::new(0),
            root_node: std::sync::OnceLock::new(),
        })
    }

    #[tokio::test]
    async fn add_mpi_shell_task_runs_through_adapter_mpiexec_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = mpi_test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx, HashMap::new());
        root.set_task(Some(TaskRef::Shell("true".to_string())));
        let log = tmp.path().join("mpi_ran.txt");
        root.add_mpi(
            MpiRequestData {
                task: TaskRef::Shell(format!("echo ran >> {}", log.display())),
                nprocs: 1,
                cpus_per_proc: 1,
                gpus_per_proc: 0,
                mps: None,
                fname: Some("mpi_shell".to_string()),
                arg: None,
                mpiarg: None,
                group_mpiarg: false,
                use_multiprocessing: Some(false),
                timeout: TimeoutSpec::None,
                priority: 0,
            },
            AddOptions::default(),
        );
        root.clone().execute().await;
        assert!(root.done());
        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents.trim(), "ran");
    }

    #[tokio::test]
    async fn add_mpi_import_task_dumps_payload_and_surfaces_sidecar_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx();
        let root = Node::new_root(Directory::new(tmp.path()), ctx, HashMap::new());
        root.set_task(Some(TaskRef::Shell("true".to_string())));
        root.add_mpi(
            MpiRequestData {
                task: TaskRef::Import("unregistered_module".to_string(), "main".to_string()),
                nprocs: 1,
                cpus_per_proc: 1,
                gpus_per_proc: 0,
                mps: None,
                fname: Some("mpi_import".to_string()),
                arg: Some(Value::Str("hello".to_string())),
                mpiarg: None,
                group_mpiarg: false,
                use_multiprocessing: Some(false),
                timeout: TimeoutSpec::None,
                priority: 0,
            },
            AddOptions::default(),
        );
        root.clone().execute().await;

        // The unresolved task fails in the sidecar process, which the
        // dispatcher surfaces as a node failure (not a panic or hang).
        assert!(ctx_failed(&root));

        let payload: MpiPayload = tokio::fs::read(tmp.path().join("mpi_import.payload.json"))
            .await
            .map(|bytes| serde_json::from_slice(&bytes).unwrap())
            .unwrap();
        assert!(matches!(payload.task, TaskRef::Import(ref m, ref s) if m == "unregistered_module" && s == "main"));
        assert_eq!(payload.arg, Some(Value::Str("hello".to_string())));
    }

    fn ctx_failed(root: &Arc<Node>) -> bool {
        root.ctx().state.is_failed() || root.ctx().state.is_aborted()
    }
}
