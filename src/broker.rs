//! Broker scheduler: admission routing, deferred enqueue, and fail recovery.
//!
//! The broker owns the timer wheel. A submission either goes straight into
//! the store (pending hash + claim set) or parks on the wheel until its
//! start time. The fail-recovery loop drains the fail set and decides, per
//! uuid, between a back-off retry (another trip through the wheel) and a
//! permanent failure (day counter increment).
//!
//! ## Task lifecycle
//!
//! ```text
//! submitted → (wheel waits) → pending (set + t_ hash) → claimed → success
//!                                     ▲                         ↘ failed
//!                                     └── retry scheduled ← fail recovery
//!                                                          ↘ permanent failure
//! ```
//!
//! The broker never writes result hashes and never touches the success
//! counter; those belong to the workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::counters;
use crate::kvs::{Kvs, FAIL_RESULT_UUID_SET, REQUEST_UUID_SET};
use crate::metrics;
use crate::types::{
    result_key, SchedulerError, SchedulerResult, ResultReply, TaskDescriptor, TASK_FIELDS,
};
use crate::wheel::{TimerWheel, DEFAULT_TICK};

/// Sleep between polls when the fail set is empty or unreachable.
const RECOVERY_IDLE_SLEEP: Duration = Duration::from_secs(1);

/// The broker scheduler.
pub struct Broker {
    kvs: Arc<dyn Kvs>,
    wheel: Arc<TimerWheel>,
    running: Arc<RwLock<bool>>,
}

impl Broker {
    /// Create a broker over a connected gateway and start its tick loop.
    pub fn new(kvs: Arc<dyn Kvs>) -> Arc<Self> {
        let wheel = Arc::new(TimerWheel::new(DEFAULT_TICK));
        tokio::spawn({
            let wheel = Arc::clone(&wheel);
            async move { wheel.start().await }
        });
        Arc::new(Self {
            kvs,
            wheel,
            running: Arc::new(RwLock::new(true)),
        })
    }

    /// Route a submission: enqueue now when eligible, otherwise park it on
    /// the wheel until its start time.
    pub async fn submit(&self, mut task: TaskDescriptor) -> SchedulerResult<()> {
        let now = chrono::Utc::now().timestamp();
        if task.start_time == 0 {
            task.start_time = now;
        }
        if task.start_time <= now {
            self.enqueue(&task).await
        } else {
            let delay = Duration::from_secs((task.start_time - now) as u64);
            debug!(uuid = %task.uuid, delay_secs = delay.as_secs(), "deferring submission");
            self.schedule_enqueue(delay, task);
            Ok(())
        }
    }

    /// Write the pending hash, then publish the uuid to the claim set.
    pub async fn enqueue(&self, task: &TaskDescriptor) -> SchedulerResult<()> {
        Self::enqueue_with(self.kvs.as_ref(), task).await
    }

    async fn enqueue_with(kvs: &dyn Kvs, task: &TaskDescriptor) -> SchedulerResult<()> {
        kvs.hash_set_fields(&task.task_key(), &task.to_fields())
            .await?;
        // If this second step fails the orphaned hash is inert: workers only
        // discover uuids through the claim set.
        kvs.set_add(REQUEST_UUID_SET, &task.uuid).await?;
        debug!(uuid = %task.uuid, attempt = task.attempt_index, "task enqueued");
        Ok(())
    }

    fn schedule_enqueue(&self, delay: Duration, task: TaskDescriptor) {
        let kvs = Arc::clone(&self.kvs);
        self.wheel.schedule(delay, async move {
            if let Err(err) = Self::enqueue_with(kvs.as_ref(), &task).await {
                error!(uuid = %task.uuid, error = %err, "deferred enqueue failed");
            }
        });
    }

    /// Long-running loop draining the fail set. One uuid at a time; an
    /// empty set backs off for a second. KVS errors are logged and the
    /// affected uuid is dropped.
    pub async fn run_fail_recovery(&self) {
        info!("fail recovery loop started");
        while *self.running.read().await {
            match self.recover_one().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(RECOVERY_IDLE_SLEEP).await,
                Err(err) => {
                    error!(error = %err, "fail set pop failed");
                    tokio::time::sleep(RECOVERY_IDLE_SLEEP).await;
                }
            }
        }
        info!("fail recovery loop stopped");
    }

    /// Pop and handle one failed uuid. Returns false when the set is empty.
    async fn recover_one(&self) -> SchedulerResult<bool> {
        let Some(uuid) = self.kvs.set_pop_one(FAIL_RESULT_UUID_SET).await? else {
            return Ok(false);
        };
        self.handle_failed(&uuid).await;
        Ok(true)
    }

    /// Decide the fate of one failed attempt: drop, retry, or permanent.
    async fn handle_failed(&self, uuid: &str) {
        let key = result_key(uuid);

        let interval = match self.kvs.hash_get_fields(&key, &["time_interval"]).await {
            Ok(values) => values.into_iter().next().flatten(),
            Err(err) => {
                error!(%uuid, error = %err, "failed to read result hash");
                return;
            }
        };
        let Some(interval) = interval else {
            warn!(%uuid, "result expired before recovery");
            return;
        };

        // No retry schedule at all: the failure is final.
        if interval.is_empty() {
            self.permanent_failure(uuid).await;
            return;
        }

        let task = match self.kvs.hash_get_fields(&key, &TASK_FIELDS).await {
            Ok(values) => match TaskDescriptor::from_fields(&values) {
                Ok(task) => task,
                Err(SchedulerError::ResultNotExist) => {
                    // Deleted between the two reads; nothing left to retry.
                    warn!(%uuid, "result expired between recovery reads");
                    return;
                }
                Err(err) => {
                    error!(%uuid, error = %err, "malformed result hash");
                    self.permanent_failure(uuid).await;
                    return;
                }
            },
            Err(err) => {
                error!(%uuid, error = %err, "failed to read result hash");
                return;
            }
        };

        if let Err(err) = self.kvs.hash_delete(&key).await {
            error!(%uuid, error = %err, "failed to delete result hash");
        }

        let next_index = task.attempt_index + 1;
        if next_index >= task.backoff_schedule.len() {
            info!(%uuid, attempts = next_index, "back-off schedule exhausted");
            self.permanent_failure(uuid).await;
            return;
        }

        let delay = Duration::from_secs(task.backoff_schedule[next_index]);
        let retry = TaskDescriptor {
            attempt_index: next_index,
            ..task
        };
        info!(%uuid, attempt = next_index, delay_secs = delay.as_secs(), "retry scheduled");
        metrics::record_retry_scheduled();
        self.schedule_enqueue(delay, retry);
    }

    async fn permanent_failure(&self, uuid: &str) {
        metrics::record_permanent_failure();
        if let Err(err) = counters::incr_failure(self.kvs.as_ref()).await {
            error!(%uuid, error = %err, "failed to bump failure counter");
        }
    }

    /// Look up the recorded result for a uuid.
    pub async fn task_result(&self, uuid: &str) -> SchedulerResult<ResultReply> {
        if uuid.is_empty() {
            return Err(SchedulerError::InvalidArgument);
        }
        let values = self
            .kvs
            .hash_get_fields(&result_key(uuid), &["is_success", "result"])
            .await?;
        let Some(is_success) = values[0].as_deref() else {
            return Err(SchedulerError::ResultNotExist);
        };
        Ok(ResultReply {
            is_result_exist: 1,
            is_success: is_success.parse()?,
            result: values[1].clone().unwrap_or_default(),
        })
    }

    /// Number of tasks currently claimable.
    pub async fn pending_count(&self) -> SchedulerResult<i64> {
        self.kvs.set_cardinality(REQUEST_UUID_SET).await
    }

    /// Success tally for a `YYYY-MM-DD` date.
    pub async fn success_count(&self, date: &str) -> SchedulerResult<i64> {
        if date.is_empty() {
            return Err(SchedulerError::InvalidArgument);
        }
        counters::success_count(self.kvs.as_ref(), date).await
    }

    /// Permanent-failure tally for a `YYYY-MM-DD` date.
    pub async fn failure_count(&self, date: &str) -> SchedulerResult<i64> {
        if date.is_empty() {
            return Err(SchedulerError::InvalidArgument);
        }
        counters::failure_count(self.kvs.as_ref(), date).await
    }

    /// Stop the recovery loop and the wheel. In-flight wheel callbacks that
    /// already fired keep running.
    pub async fn close(&self) {
        *self.running.write().await = false;
        self.wheel.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::today;
    use crate::kvs::MemoryKvs;
    use crate::types::{task_key, TaskKind, TaskReport};

    fn script_task(uuid: &str, schedule: Vec<u64>, attempt: usize) -> TaskDescriptor {
        TaskDescriptor {
            uuid: uuid.to_string(),
            kind: TaskKind::Script,
            target: "echo.sh".to_string(),
            args: String::new(),
            start_time: 0,
            backoff_schedule: schedule,
            attempt_index: attempt,
            max_run_time: 5,
        }
    }

    async fn record_failure(kvs: &dyn Kvs, task: &TaskDescriptor) {
        let report = TaskReport {
            task: task.clone(),
            is_success: false,
            result: "boom".to_string(),
        };
        kvs.hash_set_fields(&task.result_key(), &report.to_fields())
            .await
            .unwrap();
        kvs.set_add(FAIL_RESULT_UUID_SET, &task.uuid).await.unwrap();
    }

    #[tokio::test]
    async fn immediate_submit_is_claimable() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        broker.submit(script_task("u1", vec![], 0)).await.unwrap();

        assert_eq!(broker.pending_count().await.unwrap(), 1);
        let values = kvs
            .hash_get_fields(&task_key("u1"), &TASK_FIELDS)
            .await
            .unwrap();
        let stored = TaskDescriptor::from_fields(&values).unwrap();
        assert_eq!(stored.uuid, "u1");
        assert_ne!(stored.start_time, 0, "zero start time is stamped with now");
        broker.close().await;
    }

    #[tokio::test]
    async fn deferred_submit_waits_for_start_time() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        let mut task = script_task("u2", vec![], 0);
        task.start_time = chrono::Utc::now().timestamp() + 2;
        broker.submit(task).await.unwrap();

        assert_eq!(broker.pending_count().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(broker.pending_count().await.unwrap(), 1);
        broker.close().await;
    }

    #[tokio::test]
    async fn recovery_drops_empty_schedule_and_counts_failure() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        let task = script_task("u3", vec![], 0);
        record_failure(kvs.as_ref(), &task).await;

        assert!(broker.recover_one().await.unwrap());
        assert_eq!(broker.failure_count(&today()).await.unwrap(), 1);
        assert_eq!(broker.pending_count().await.unwrap(), 0);
        broker.close().await;
    }

    #[tokio::test]
    async fn recovery_schedules_retry_with_advanced_attempt() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        let task = script_task("u4", vec![0, 0], 0);
        record_failure(kvs.as_ref(), &task).await;

        assert!(broker.recover_one().await.unwrap());

        // Result hash is consumed by recovery.
        let values = kvs
            .hash_get_fields(&result_key("u4"), &["uuid"])
            .await
            .unwrap();
        assert_eq!(values, vec![None]);

        // Zero back-off: the retry lands on the next wheel tick.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.pending_count().await.unwrap(), 1);

        let values = kvs
            .hash_get_fields(&task_key("u4"), &TASK_FIELDS)
            .await
            .unwrap();
        let retried = TaskDescriptor::from_fields(&values).unwrap();
        assert_eq!(retried.attempt_index, 1);
        assert_eq!(retried.backoff_schedule, vec![0, 0]);
        assert_eq!(retried.target, "echo.sh");
        broker.close().await;
    }

    #[tokio::test]
    async fn recovery_exhausted_schedule_is_permanent() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        let task = script_task("u5", vec![0, 0], 1);
        record_failure(kvs.as_ref(), &task).await;

        assert!(broker.recover_one().await.unwrap());
        assert_eq!(broker.failure_count(&today()).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.pending_count().await.unwrap(), 0);
        broker.close().await;
    }

    #[tokio::test]
    async fn recovery_on_expired_result_is_a_drop() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        // uuid in the fail set but no result hash behind it.
        kvs.set_add(FAIL_RESULT_UUID_SET, "ghost").await.unwrap();

        assert!(broker.recover_one().await.unwrap());
        assert_eq!(broker.failure_count(&today()).await.unwrap(), 0);
        assert_eq!(broker.pending_count().await.unwrap(), 0);
        broker.close().await;
    }

    #[tokio::test]
    async fn recovery_empty_set_reports_idle() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));
        assert!(!broker.recover_one().await.unwrap());
        broker.close().await;
    }

    #[tokio::test]
    async fn task_result_reply_shapes() {
        let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
        let broker = Broker::new(Arc::clone(&kvs));

        assert!(matches!(
            broker.task_result("unknown").await,
            Err(SchedulerError::ResultNotExist)
        ));
        assert!(matches!(
            broker.task_result("").await,
            Err(SchedulerError::InvalidArgument)
        ));

        let report = TaskReport {
            task: script_task("u6", vec![], 0),
            is_success: true,
            result: "pong".to_string(),
        };
        kvs.hash_set_fields(&result_key("u6"), &report.to_fields())
            .await
            .unwrap();

        let reply = broker.task_result("u6").await.unwrap();
        assert_eq!(
            reply,
            ResultReply {
                is_result_exist: 1,
                is_success: 1,
                result: "pong".to_string(),
            }
        );
        broker.close().await;
    }
}
