//! Admission-controlled scheduler for MPI and multiprocessing tasks.
//!
//! One process-wide `Dispatcher` gates every parallel submission against a
//! fixed pool of cluster nodes (fractional weight, for MPI) or process slots
//! (integer weight, for multiprocessing). Completions release capacity and
//! re-admit from `pending` by (priority desc, weight desc, insertion order).

use crate::cluster::ClusterAdapter;
use crate::error::DispatcherError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

/// Node-count (MPI) or process-count (multiprocessing) consumed by a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Weight {
    Mpi(f64),
    MultiProc(u32),
}

impl Weight {
    fn as_f64(&self) -> f64 {
        match self {
            Weight::Mpi(w) => *w,
            Weight::MultiProc(w) => *w as f64,
        }
    }

    fn same_kind(&self, other: &Weight) -> bool {
        matches!(
            (self, other),
            (Weight::Mpi(_), Weight::Mpi(_)) | (Weight::MultiProc(_), Weight::MultiProc(_))
        )
    }
}

struct PendingEntry {
    weight: Weight,
    priority: i32,
    seq: u64,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct DispatcherInner {
    pending: HashMap<u64, PendingEntry>,
    running: HashMap<u64, Weight>,
    next_id: u64,
    next_seq: u64,
}

/// Arity-erasing post-processing hook, since Rust has no runtime introspection
/// of a closure's parameter count — the caller picks the variant that matches
/// what it wants inspected.
pub enum CheckOutput {
    None,
    NoArgs(Box<dyn Fn() -> Result<(), String> + Send + Sync>),
    Stdout(Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>),
    StdoutStderr(Box<dyn Fn(&str, &str) -> Result<(), String> + Send + Sync>),
}

pub enum OnTimeout {
    Ignore,
    Raise,
    Callback(Box<dyn Fn() + Send + Sync>),
}

pub enum Timeout {
    None,
    Auto,
    Minutes(f64),
}

/// Arguments for a single `mpiexec` submission. Mirrors the Python signature
/// in shape; grouped into a struct because Rust doesn't tolerate a dozen
/// positional parameters gracefully.
pub struct MpiExecRequest<'a> {
    pub cmd: String,
    pub nprocs: u32,
    pub cpus_per_proc: u32,
    pub gpus_per_proc: u32,
    pub mps: Option<u32>,
    pub fname: String,
    pub mpiarg: Option<Vec<String>>,
    pub group_mpiarg: bool,
    pub check_output: CheckOutput,
    pub use_multiprocessing: bool,
    pub timeout: Timeout,
    pub on_timeout: OnTimeout,
    pub priority: i32,
    pub dir: &'a Path,
}

pub struct Dispatcher {
    adapter: Arc<dyn ClusterAdapter>,
    nnodes: f64,
    mp_nprocs_max: u32,
    inner: Mutex<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(adapter: Arc<dyn ClusterAdapter>, nnodes: f64, mp_nprocs_max: u32) -> Self {
        Self {
            adapter,
            nnodes,
            mp_nprocs_max,
            inner: Mutex::new(DispatcherInner::default()),
        }
    }

    fn capacity_for(&self, weight: &Weight) -> f64 {
        match weight {
            Weight::Mpi(_) => self.nnodes,
            Weight::MultiProc(_) => self.mp_nprocs_max as f64,
        }
    }

    /// §4.4.1 weight computation.
    pub fn compute_weight(
        &self,
        nprocs: u32,
        cpus_per_proc: u32,
        gpus_per_proc: u32,
        mps: Option<u32>,
        use_multiprocessing: bool,
    ) -> Result<Weight, DispatcherError> {
        if use_multiprocessing {
            return Ok(Weight::MultiProc(nprocs));
        }

        let cpus_per_node = self.adapter.cpus_per_node().max(1) as f64;
        let gpus_per_node = self.adapter.gpus_per_node().max(1) as f64;
        let base = (nprocs as f64 * cpus_per_proc as f64) / cpus_per_node;

        let mut weight = base;
        if let Some(mps) = mps {
            if mps == 0 || nprocs % mps != 0 {
                return Err(DispatcherError::MpsMismatch { nprocs, mps });
            }
            let gpu_pressure = (nprocs as f64 / mps as f64) / gpus_per_node;
            weight = weight.max(gpu_pressure);
        } else if gpus_per_proc > 0 {
            let gpu_pressure = (nprocs as f64 * gpus_per_proc as f64) / gpus_per_node;
            weight = weight.max(gpu_pressure);
        }

        if !self.adapter.node_splittable() {
            weight = weight.ceil();
        }

        Ok(Weight::Mpi(weight))
    }

    /// §4.4.2 admission: acquire `weight` at `priority`, waiting in `pending`
    /// if it doesn't currently fit. Returns the lock id to release later.
    async fn acquire(&self, weight: Weight, priority: i32) -> u64 {
        let (id, rx) = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;

            if Self::admits(&inner, &weight, self.capacity_for(&weight)) {
                inner.running.insert(id, weight);
                return id;
            }

            let (tx, rx) = oneshot::channel();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.insert(
                id,
                PendingEntry {
                    weight,
                    priority,
                    seq,
                    notify: tx,
                },
            );
            (id, rx)
        };
        // `release` moves this id from `pending` into `running` before
        // firing `notify`, so by the time we wake up admission is settled.
        let _ = rx.await;
        id
    }

    fn admits(inner: &DispatcherInner, weight: &Weight, capacity: f64) -> bool {
        let running_same_kind: f64 = inner
            .running
            .values()
            .filter(|w| w.same_kind(weight))
            .map(|w| w.as_f64())
            .sum();
        running_same_kind == 0.0 || weight.as_f64() <= capacity - running_same_kind
    }

    /// §4.4.2 release: free `id`'s weight, then greedily admit pending
    /// entries sorted by (priority desc, weight desc, insertion order).
    async fn release(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.running.remove(&id);

        let mut ids: Vec<u64> = inner.pending.keys().copied().collect();
        ids.sort_by(|a, b| {
            let ea = &inner.pending[a];
            let eb = &inner.pending[b];
            eb.priority
                .cmp(&ea.priority)
                .then(eb.weight.as_f64().total_cmp(&ea.weight.as_f64()))
                .then(ea.seq.cmp(&eb.seq))
        });

        for pid in ids {
            let capacity = self.capacity_for(&inner.pending[&pid].weight);
            let weight = inner.pending[&pid].weight;
            if Self::admits(&inner, &weight, capacity) {
                let entry = inner.pending.remove(&pid).unwrap();
                inner.running.insert(pid, weight);
                let _ = entry.notify.send(());
            }
        }
    }

    /// §4.4.3 argument fan-out: stable sort, chunk into `nprocs` contiguous
    /// pieces, shrinking `nprocs` if the last chunk would be empty.
    pub fn fan_out(mut items: Vec<String>, nprocs: u32) -> (u32, Vec<Vec<String>>) {
        items.sort();
        let mut nprocs = nprocs.max(1);
        let chunk_size = (items.len() as f64 / nprocs as f64).ceil() as usize;
        let chunk_size = chunk_size.max(1);
        let mut chunks: Vec<Vec<String>> = items
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        while chunks.len() > 1 && chunks.last().map(|c| c.is_empty()).unwrap_or(false) {
            chunks.pop();
        }
        nprocs = chunks.len().max(1) as u32;
        (nprocs, chunks)
    }

    /// §4.4 full submission: admission, launch, timeout, error/post-processing.
    /// Returns the file stem actually used for the per-task log files.
    pub async fn mpiexec(&self, mut req: MpiExecRequest<'_>) -> Result<String, DispatcherError> {
        if let Some(mpiarg) = &req.mpiarg {
            req.nprocs = req.nprocs.min(mpiarg.len().max(1) as u32);
        }

        let weight = self.compute_weight(
            req.nprocs,
            req.cpus_per_proc,
            req.gpus_per_proc,
            req.mps,
            req.use_multiprocessing,
        )?;

        let id = self.acquire(weight, req.priority).await;
        let result = self.launch(&req).await;
        self.release(id).await;
        result
    }

    async fn launch(&self, req: &MpiExecRequest<'_>) -> Result<String, DispatcherError> {
        let fname = unique_stem(req.dir, &req.fname);
        let log_path = req.dir.join(format!("{fname}.log"));
        let stdout_path = req.dir.join(format!("{fname}.stdout"));
        let stderr_path = req.dir.join(format!("{fname}.stderr"));
        let error_path = req.dir.join(format!("{fname}.error"));

        let launch_cmd = if req.use_multiprocessing {
            format!("{} --mp {}", req.cmd, req.nprocs)
        } else {
            self.adapter.mpiexec(
                &req.cmd,
                req.nprocs,
                req.cpus_per_proc,
                req.gpus_per_proc,
                req.mps,
            )
        };

        tokio::fs::write(&log_path, format!("{launch_cmd}\n")).await?;

        let start = Instant::now();
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&launch_cmd)
            .current_dir(req.dir)
            .stdout(std::fs::File::create(&stdout_path)?)
            .stderr(std::fs::File::create(&stderr_path)?);
        let mut child = command.spawn()?;

        let wait_result = match self.resolve_timeout(&req.timeout) {
            None => Ok(child.wait().await),
            Some((minutes, from_remaining)) => {
                let dur = Duration::from_secs_f64((minutes * 60.0).max(0.0));
                match tokio::time::timeout(dur, child.wait()).await {
                    Ok(status) => Ok(status),
                    Err(_elapsed) => {
                        let _ = child.start_kill();
                        if from_remaining {
                            return Err(DispatcherError::InsufficientWalltime);
                        }
                        match req.on_timeout {
                            OnTimeout::Raise => return Err(DispatcherError::Timeout(dur)),
                            OnTimeout::Callback(ref cb) => {
                                cb();
                                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"))
                            }
                            OnTimeout::Ignore => {
                                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out (ignored)"))
                            }
                        }
                    }
                }
            }
        };

        let elapsed = start.elapsed();
        let status = match wait_result {
            Ok(status) => status?,
            Err(_timed_out_ignored) => {
                let elapsed_line = format!("# elapsed: {:.3}s (timed out, ignored)\n", elapsed.as_secs_f64());
                let mut existing = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                existing.push_str(&elapsed_line);
                tokio::fs::write(&log_path, existing).await?;
                return Ok(fname);
            }
        };

        let elapsed_line = format!("# elapsed: {:.3}s\n", elapsed.as_secs_f64());
        let mut existing = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        existing.push_str(&elapsed_line);
        tokio::fs::write(&log_path, existing).await?;

        if error_path.exists() {
            let content = tokio::fs::read_to_string(&error_path).await.unwrap_or_default();
            return Err(DispatcherError::NonZeroExit {
                cmd: content,
                code: status.code().unwrap_or(-1),
            });
        }

        if !status.success() {
            return Err(DispatcherError::NonZeroExit {
                cmd: launch_cmd,
                code: status.code().unwrap_or(-1),
            });
        }

        self.check_output(req, &stdout_path, &stderr_path).await?;

        Ok(fname)
    }

    async fn check_output(
        &self,
        req: &MpiExecRequest<'_>,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<(), DispatcherError> {
        match &req.check_output {
            CheckOutput::None => Ok(()),
            CheckOutput::NoArgs(f) => f().map_err(DispatcherError::OutputRejected),
            CheckOutput::Stdout(f) => {
                let out = tokio::fs::read_to_string(stdout_path).await.unwrap_or_default();
                f(&out).map_err(DispatcherError::OutputRejected)
            }
            CheckOutput::StdoutStderr(f) => {
                let out = tokio::fs::read_to_string(stdout_path).await.unwrap_or_default();
                let err = tokio::fs::read_to_string(stderr_path).await.unwrap_or_default();
                f(&out, &err).map_err(DispatcherError::OutputRejected)
            }
        }
    }

    /// Returns `(minutes, from_remaining_walltime)`.
    fn resolve_timeout(&self, timeout: &Timeout) -> Option<(f64, bool)> {
        match timeout {
            Timeout::None => None,
            Timeout::Minutes(m) => Some((*m, false)),
            Timeout::Auto => {
                if self.adapter.in_queue() {
                    self.adapter.remaining().map(|m| (m, true))
                } else {
                    None
                }
            }
        }
    }
}

pub(crate) fn unique_stem(dir: &Path, fname: &str) -> String {
    let mut candidate = fname.to_string();
    let mut n = 1;
    while dir.join(format!("{candidate}.log")).exists() {
        candidate = format!("{fname}#{n}");
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Local;

    fn dispatcher() -> Dispatcher {
        let adapter = Arc::new(Local {
            cpus_per_node: 32,
            gpus_per_node: 4,
        });
        Dispatcher::new(adapter, 4.0, 128)
    }

    #[test]
    fn compute_weight_mps_mismatch_errors() {
        let d = dispatcher();
        let err = d.compute_weight(3, 1, 0, Some(2), false).unwrap_err();
        assert!(matches!(err, DispatcherError::MpsMismatch { .. }));
    }

    #[test]
    fn compute_weight_rounds_up_when_not_splittable() {
        struct NotSplittable;
        #[async_trait::async_trait]
        impl ClusterAdapter for NotSplittable {
            fn cpus_per_node(&self) -> u32 {
                32
            }
            fn gpus_per_node(&self) -> u32 {
                4
            }
            fn node_splittable(&self) -> bool {
                false
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
            fn mpiexec(&self, cmd: &str, _: u32, _: u32, _: u32, _: Option<u32>) -> String {
                cmd.to_string()
            }
            async fn requeue(&self) {}
        }
        let d = Dispatcher::new(Arc::new(NotSplittable), 4.0, 128);
        let w = d.compute_weight(1, 1, 0, None, false).unwrap();
        assert_eq!(w, Weight::Mpi(1.0));
        let w = d.compute_weight(1, 8, 0, None, false).unwrap();
        // 1*8/32 = 0.25, ceilinged to 1 since not splittable
        assert_eq!(w, Weight::Mpi(1.0));
    }

    #[test]
    fn fan_out_shrinks_nprocs_to_avoid_empty_chunks() {
        let items: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let (nprocs, chunks) = Dispatcher::fan_out(items, 8);
        assert_eq!(nprocs, chunks.len() as u32);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[tokio::test]
    async fn admission_respects_capacity() {
        let d = dispatcher();
        let id_a = d.acquire(Weight::Mpi(3.0), 0).await;
        // second task of weight 2.0 doesn't fit (3.0 + 2.0 > 4.0 capacity) and
        // would block, so we only assert the first admission succeeded and
        // release it to avoid hanging the test on a pending future.
        d.release(id_a).await;
        let id_b = d.acquire(Weight::Mpi(4.0), 0).await;
        d.release(id_b).await;
    }
}
