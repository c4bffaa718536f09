//! Day-bucketed success/failure tallies.
//!
//! Counters are advisory observability state: they never gate scheduling.
//! Keys are bucketed by local calendar day and expire 30 days after their
//! first increment.

use chrono::Local;

use crate::kvs::Kvs;
use crate::types::SchedulerResult;

/// Bucket key date format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// TTL applied to a counter bucket on its first increment.
pub const COUNTER_TTL_SECS: u64 = 60 * 60 * 24 * 30;

/// Key of the permanent-failure counter for a date.
pub fn fail_task_key(date: &str) -> String {
    format!("fail_task_count:{date}")
}

/// Key of the success counter for a date.
pub fn success_task_key(date: &str) -> String {
    format!("success_task_count:{date}")
}

/// Today's bucket date.
pub fn today() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

/// Increment today's success counter.
pub async fn incr_success(kvs: &dyn Kvs) -> SchedulerResult<()> {
    incr(kvs, &success_task_key(&today())).await
}

/// Increment today's permanent-failure counter.
pub async fn incr_failure(kvs: &dyn Kvs) -> SchedulerResult<()> {
    incr(kvs, &fail_task_key(&today())).await
}

async fn incr(kvs: &dyn Kvs, key: &str) -> SchedulerResult<()> {
    let count = kvs.counter_incr(key).await?;
    // First write of the bucket carries the TTL.
    if count == 1 {
        kvs.set_ttl(key, COUNTER_TTL_SECS).await?;
    }
    Ok(())
}

/// Read the success counter for a date; absent buckets read as 0.
pub async fn success_count(kvs: &dyn Kvs, date: &str) -> SchedulerResult<i64> {
    kvs.counter_get(&success_task_key(date)).await
}

/// Read the permanent-failure counter for a date; absent buckets read as 0.
pub async fn failure_count(kvs: &dyn Kvs, date: &str) -> SchedulerResult<i64> {
    kvs.counter_get(&fail_task_key(date)).await
}
