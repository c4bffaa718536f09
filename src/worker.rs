//! Worker runner: claims pending tasks and executes them.
//!
//! The claim loop pops one uuid at a time from the claim set, loads and
//! deletes the task hash (so no other worker can observe it), executes the
//! task under a hard timeout, and records the outcome as a result hash.
//! Failed attempts additionally join the fail set for the broker's recovery
//! loop to judge.
//!
//! A single claim loop per process is enough; parallelism comes from
//! running more worker processes.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::counters;
use crate::kvs::{Kvs, FAIL_RESULT_UUID_SET, REQUEST_UUID_SET};
use crate::metrics;
use crate::types::{
    task_key, SchedulerError, SchedulerResult, TaskDescriptor, TaskKind, TaskReport, TASK_FIELDS,
};

/// Sleep between polls when the claim set is empty or unreachable.
const CLAIM_IDLE_SLEEP: Duration = Duration::from_secs(1);

/// The worker runner.
pub struct Worker {
    cfg: WorkerConfig,
    kvs: Arc<dyn Kvs>,
    http: reqwest::Client,
    running: Arc<RwLock<bool>>,
}

impl Worker {
    pub fn new(cfg: WorkerConfig, kvs: Arc<dyn Kvs>) -> Self {
        Self {
            cfg,
            kvs,
            http: reqwest::Client::new(),
            running: Arc::new(RwLock::new(true)),
        }
    }

    /// Claim loop, repeated until [`close`](Self::close).
    pub async fn run(&self) {
        info!("worker started");
        while *self.running.read().await {
            match self.claim_one().await {
                Ok(true) => {
                    if self.cfg.period != 0 {
                        tokio::time::sleep(Duration::from_secs(self.cfg.period)).await;
                    }
                }
                Ok(false) => tokio::time::sleep(CLAIM_IDLE_SLEEP).await,
                Err(err) => {
                    error!(error = %err, "claim failed");
                    tokio::time::sleep(CLAIM_IDLE_SLEEP).await;
                }
            }
        }
        info!("worker stopped");
    }

    /// Stop the claim loop after the in-flight task, if any, completes.
    pub async fn close(&self) {
        *self.running.write().await = false;
    }

    /// Claim and process one task. Returns false when nothing is pending.
    async fn claim_one(&self) -> SchedulerResult<bool> {
        let Some(uuid) = self.kvs.set_pop_one(REQUEST_UUID_SET).await? else {
            return Ok(false);
        };

        let key = task_key(&uuid);
        let values = self.kvs.hash_get_fields(&key, &TASK_FIELDS).await?;
        let task = match TaskDescriptor::from_fields(&values) {
            Ok(task) => task,
            Err(SchedulerError::ResultNotExist) => {
                // Raced with expiry or recovery; the claim is already spent.
                warn!(%uuid, "task hash missing at claim");
                return Ok(true);
            }
            Err(err) => {
                error!(%uuid, error = %err, "malformed task hash");
                return Ok(true);
            }
        };

        // Delete before execution so a concurrent worker cannot observe the
        // same task. Together with the atomic pop this gives at-most-one
        // execution per enqueue.
        if let Err(err) = self.kvs.hash_delete(&key).await {
            error!(%uuid, error = %err, "failed to delete task hash");
        }

        let started = Instant::now();
        let outcome = self.execute(&task).await;
        let elapsed = started.elapsed();

        let (is_success, result) = match outcome {
            Ok(output) => (true, output),
            Err(err) => (false, err.to_string()),
        };
        metrics::record_execution(is_success, elapsed.as_secs_f64());
        info!(%uuid, is_success, elapsed_ms = elapsed.as_millis() as u64, "task executed");

        let report = TaskReport {
            task,
            is_success,
            result,
        };
        if let Err(err) = self.record(&report).await {
            error!(%uuid, error = %err, "failed to record result");
        }
        Ok(true)
    }

    /// Write the result hash with its TTL; failed attempts join the fail
    /// set, successes bump the day counter.
    async fn record(&self, report: &TaskReport) -> SchedulerResult<()> {
        let key = report.task.result_key();
        self.kvs.hash_set_fields(&key, &report.to_fields()).await?;
        if !report.is_success {
            self.kvs
                .set_add(FAIL_RESULT_UUID_SET, &report.task.uuid)
                .await?;
        }
        self.kvs.set_ttl(&key, self.cfg.result_keep_time).await?;
        if report.is_success {
            counters::incr_success(self.kvs.as_ref()).await?;
        }
        Ok(())
    }

    async fn execute(&self, task: &TaskDescriptor) -> SchedulerResult<String> {
        match task.kind {
            TaskKind::Script => self.run_script(task).await,
            _ => self.run_http(task).await,
        }
    }

    /// Resolve the script under the binary root and run it with a hard
    /// timeout. Non-empty stderr is a failure even on a clean exit.
    async fn run_script(&self, task: &TaskDescriptor) -> SchedulerResult<String> {
        let bin_path = Path::new(&self.cfg.bin_path).join(&task.target);
        if tokio::fs::metadata(&bin_path).await.is_err() {
            warn!(target = %task.target, "script target missing");
            return Err(SchedulerError::FileNotFound);
        }

        let max_run_time = if task.max_run_time == 0 {
            self.cfg.task_run_time
        } else {
            task.max_run_time
        };

        let args: Vec<&str> = if task.args.is_empty() {
            Vec::new()
        } else {
            task.args.split(' ').collect()
        };
        self.exec_bin(&bin_path, &args, max_run_time).await
    }

    async fn exec_bin(
        &self,
        bin_path: &Path,
        args: &[&str],
        max_run_time: u64,
    ) -> SchedulerResult<String> {
        let mut child = Command::new(bin_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SchedulerError::Execution(err.to_string()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Execution("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::Execution("stderr not captured".to_string()))?;

        let read_out = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf).await;
            buf
        });
        let read_err = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        // Whichever of completion and timeout fires first wins. A zero
        // timeout leaves the process unbounded.
        let status = if max_run_time == 0 {
            child.wait().await
        } else {
            match tokio::time::timeout(Duration::from_secs(max_run_time), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        error!(path = %bin_path.display(), error = %err, "failed to kill timed-out process");
                    }
                    warn!(path = %bin_path.display(), "process killed after timeout");
                    // Drain the pipe readers so nothing leaks.
                    let _ = read_out.await;
                    let _ = read_err.await;
                    return Err(SchedulerError::ExecTimeout);
                }
            }
        };
        let status = status.map_err(|err| SchedulerError::Execution(err.to_string()))?;

        let stdout = read_out.await.unwrap_or_default();
        let stderr = read_err.await.unwrap_or_default();

        let stderr = stderr.trim_end_matches('\n');
        if !stderr.is_empty() {
            return Err(SchedulerError::Execution(stderr.to_string()));
        }
        if !status.success() {
            return Err(SchedulerError::Execution(format!("exit status: {status}")));
        }
        Ok(stdout.trim_end_matches('\n').to_string())
    }

    /// Issue the mapped HTTP request with `args` as a JSON body when
    /// non-empty. Any non-2xx response is a failure carrying the body.
    async fn run_http(&self, task: &TaskDescriptor) -> SchedulerResult<String> {
        let Some(method) = task.kind.http_method() else {
            return Err(SchedulerError::MessageType);
        };

        let mut request = self.http.request(method, &task.target);
        if let Some(timeout) = self.http_timeout(task.max_run_time) {
            request = request.timeout(timeout);
        }
        if !task.args.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(task.args.clone());
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                SchedulerError::ExecTimeout
            } else {
                SchedulerError::Execution(err.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SchedulerError::Execution(err.to_string()))?;
        if !status.is_success() {
            return Err(SchedulerError::Execution(body));
        }
        Ok(body)
    }

    /// Client-level timeout: a non-zero worker default takes precedence
    /// over the per-task limit. Zero on both sides disables the timeout.
    fn http_timeout(&self, max_run_time: u64) -> Option<Duration> {
        let secs = if self.cfg.task_run_time != 0 {
            self.cfg.task_run_time
        } else {
            max_run_time
        };
        (secs != 0).then(|| Duration::from_secs(secs))
    }
}
