/// Daemon - Worker Pool and Judging Feed
///
/// **Responsibility:**
/// Bound concurrency to `max_worker` and fan judging tasks out.
///
/// **Architecture:**
/// 1. `TaskQueue::add_task` pushes onto a bounded channel (capacity 100), waiting when full
/// 2. `Daemon::run` spawns exactly `max_worker` long-lived routines
/// 3. Each routine: dequeue → acquire CPU slot → run pipeline → release slot
/// 4. Dropping every `TaskQueue` closes the channel; routines drain it and exit
///
/// The pool worker is the only place infrastructure failures are logged and
/// turned into judge errors.

use crate::endpoint::{Endpoint, HttpEndpoint};
use crate::pipeline::{unused_path, Outcome, Pipeline, Task};
use crate::slots::{CpuSlot, CpuSlots};
use anyhow::{Context, Result};
use judgehost_common::types::JudgeInfo;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const QUEUE_CAPACITY: usize = 100;
const SLOT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Producer side of the task queue.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
}

impl TaskQueue {
    /// Enqueue `task`, waiting while the queue is full.
    pub async fn add_task(&self, task: Task) -> Result<()> {
        let judging_id = task.info.judging_id;
        self.sender
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("task queue closed"))?;
        debug!(judging_id, "Task queued");
        Ok(())
    }
}

pub struct Daemon {
    pipeline: Arc<Pipeline>,
    slots: CpuSlots,
    max_worker: usize,
    max_retry: u32,
    receiver: mpsc::Receiver<Task>,
}

/// Running worker routines.
pub struct Pool {
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Wait for every routine to drain the queue and exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker routine panicked");
            }
        }
    }
}

impl Daemon {
    pub fn new(pipeline: Arc<Pipeline>, slots: CpuSlots, max_worker: usize, max_retry: u32) -> (Self, TaskQueue) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let daemon = Self {
            pipeline,
            slots,
            max_worker,
            max_retry,
            receiver,
        };
        (daemon, TaskQueue { sender })
    }

    pub fn run(self) -> Pool {
        info!(max_worker = self.max_worker, cpus = self.slots.capacity(), "Starting worker pool");
        let receiver = Arc::new(Mutex::new(self.receiver));
        let workers = (0..self.max_worker)
            .map(|worker| {
                let routine = Routine {
                    worker,
                    receiver: Arc::clone(&receiver),
                    pipeline: Arc::clone(&self.pipeline),
                    slots: self.slots.clone(),
                    max_retry: self.max_retry,
                };
                tokio::spawn(routine.run())
            })
            .collect();
        Pool { workers }
    }
}

struct Routine {
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    pipeline: Arc<Pipeline>,
    slots: CpuSlots,
    max_retry: u32,
}

impl Routine {
    async fn run(self) {
        loop {
            let task = self.receiver.lock().await.recv().await;
            let Some(task) = task else {
                debug!(worker = self.worker, "Queue closed, worker exiting");
                return;
            };
            self.process(task).await;
        }
    }

    /// Waits while another task holds a CPU, since its release is certain.
    /// Retries count only when no slot is held at all.
    async fn acquire_slot(&self) -> Option<CpuSlot> {
        let mut attempt = 0;
        loop {
            let released = self.slots.released();
            if let Some(slot) = self.slots.acquire() {
                return Some(slot);
            }
            if self.slots.busy() > 0 {
                debug!(worker = self.worker, "Every CPU busy, waiting for a release");
                released.await;
                continue;
            }
            if attempt >= self.max_retry {
                return None;
            }
            attempt += 1;
            debug!(worker = self.worker, attempt, "No CPU available, retrying");
            tokio::time::sleep(SLOT_RETRY_DELAY).await;
        }
    }

    async fn process(&self, task: Task) {
        let judging_id = task.info.judging_id;
        let Some(slot) = self.acquire_slot().await else {
            error!(worker = self.worker, judging_id, "No CPU available, giving up");
            self.report_failure(judging_id, "judge error: no CPU available").await;
            return;
        };
        let cpu = slot.id();
        info!(
            worker = self.worker,
            submit_id = task.info.submit_id,
            judging_id,
            cpu,
            busy = self.slots.busy(),
            "Judging started"
        );

        let outcome = self.pipeline.run(&task, cpu).await;
        // Container is gone by now; the slot may be reused
        self.slots.release(slot);

        match outcome {
            Outcome::Completed { judged } => {
                info!(judging_id, judged, "Judging completed");
            }
            Outcome::CompileError => info!(judging_id, "Judging ended with compile error"),
            Outcome::Rejected { testcase_id, verdict } => {
                info!(judging_id, testcase_id, verdict = %verdict, "Judging ended early");
            }
            Outcome::Failed(e) => {
                let message = format!("{:#}", e);
                error!(judging_id, error = %message, "Judging failed");
                self.report_failure(judging_id, &message).await;
            }
        }
    }

    async fn report_failure(&self, judging_id: i64, message: &str) {
        if let Err(e) = self.pipeline.endpoint().judge_error(judging_id, message).await {
            error!(judging_id, error = %format!("{:#}", e), "Failed to report judge error");
        }
    }
}

/// Exclusive working directory for `info`. A leftover directory of the same
/// name is moved aside to `<dir>-old-<unix seconds>`, suffixed `-N` when taken.
pub fn prepare_workdir(judge_root: &Path, info: &JudgeInfo) -> Result<PathBuf> {
    let workdir = judge_root.join(info.workdir_name());
    if workdir.exists() {
        let stale = unused_path(
            judge_root,
            &format!("{}-old-{}", info.workdir_name(), chrono::Utc::now().timestamp()),
        );
        warn!(from = %workdir.display(), to = %stale.display(), "Workdir exists, moving it aside");
        fs::rename(&workdir, &stale).context("cannot move stale workdir")?;
    }
    fs::create_dir_all(&workdir)
        .with_context(|| format!("cannot create workdir {}", workdir.display()))?;
    Ok(workdir)
}

/// Request judgings until `shutdown` flips, queueing each one.
pub async fn feed(
    endpoint: &HttpEndpoint,
    queue: &TaskQueue,
    judge_root: &Path,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let max_jitter = poll_interval.as_millis() as u64;
    loop {
        let jitter = Duration::from_millis(rand::rng().random_range(0..=max_jitter));
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(jitter) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let info = match endpoint.fetch_judging().await {
            Ok(Some(info)) => info,
            Ok(None) => {
                debug!("No judging available");
                continue;
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Request judging failed");
                continue;
            }
        };
        info!(
            submit_id = info.submit_id,
            judging_id = info.judging_id,
            contest_id = info.contest_id,
            language = %info.language,
            "Received judging"
        );

        let workdir = match prepare_workdir(judge_root, &info) {
            Ok(dir) => dir,
            Err(e) => {
                let message = format!("{:#}", e);
                error!(judging_id = info.judging_id, error = %message, "Cannot prepare workdir");
                if let Err(e) = endpoint.judge_error(info.judging_id, &message).await {
                    error!(error = %format!("{:#}", e), "Failed to report judge error");
                }
                continue;
            }
        };
        queue.add_task(Task { info, workdir }).await?;
    }
    info!("Judging feed stopped");
    Ok(())
}
