//! End-to-end scheduler flows over the in-process KVS backend: broker and
//! worker wired together, real subprocess execution, real wheel timing.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskwheel::broker::Broker;
use taskwheel::config::WorkerConfig;
use taskwheel::counters;
use taskwheel::kvs::{Kvs, MemoryKvs};
use taskwheel::types::{result_key, ResultReply, SchedulerError, TaskDescriptor, TaskKind};
use taskwheel::worker::Worker;

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    writeln!(file, "{body}").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn script_task(uuid: &str, target: &str, args: &str, schedule: Vec<u64>) -> TaskDescriptor {
    TaskDescriptor {
        uuid: uuid.to_string(),
        kind: TaskKind::Script,
        target: target.to_string(),
        args: args.to_string(),
        start_time: 0,
        backoff_schedule: schedule,
        attempt_index: 0,
        max_run_time: 5,
    }
}

struct Harness {
    mem: Arc<MemoryKvs>,
    broker: Arc<Broker>,
    worker: Arc<Worker>,
    dir: tempfile::TempDir,
}

/// Broker + worker + recovery loop over one in-memory store.
fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mem = Arc::new(MemoryKvs::new());
    let kvs: Arc<dyn Kvs> = mem.clone();

    let broker = Broker::new(Arc::clone(&kvs));
    tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.run_fail_recovery().await }
    });

    let cfg = WorkerConfig {
        bin_path: dir.path().display().to_string(),
        result_keep_time: 600,
        task_run_time: 5,
        ..WorkerConfig::default()
    };
    let worker = Arc::new(Worker::new(cfg, kvs));
    tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });

    Harness {
        mem,
        broker,
        worker,
        dir,
    }
}

async fn wait_result(broker: &Broker, uuid: &str, secs: u64) -> ResultReply {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if let Ok(reply) = broker.task_result(uuid).await {
            return reply;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no result recorded for {uuid}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_failure_count(broker: &Broker, want: i64, secs: u64) {
    let date = counters::today();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if broker.failure_count(&date).await.unwrap() >= want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "failure counter never reached {want}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn successful_script_records_result_and_counter() {
    let h = harness();
    write_script(h.dir.path(), "echo.sh", "echo \"$@\"");

    h.broker
        .submit(script_task("s1", "echo.sh", "hello", vec![]))
        .await
        .unwrap();

    let reply = wait_result(&h.broker, "s1", 10).await;
    assert_eq!(
        reply,
        ResultReply {
            is_result_exist: 1,
            is_success: 1,
            result: "hello".to_string(),
        }
    );

    assert_eq!(
        h.broker.success_count(&counters::today()).await.unwrap(),
        1
    );
    assert_eq!(h.mem.ttl_of(&result_key("s1")).await, Some(600));

    h.worker.close().await;
    h.broker.close().await;
}

#[tokio::test]
async fn missing_script_becomes_permanent_failure() {
    let h = harness();

    h.broker
        .submit(script_task("s2", "missing.sh", "", vec![]))
        .await
        .unwrap();

    let reply = wait_result(&h.broker, "s2", 10).await;
    assert_eq!(reply.is_success, 0);
    assert!(reply.result.contains("file not exist"));

    // Empty back-off schedule: recovery drops the task and counts it.
    wait_failure_count(&h.broker, 1, 10).await;
    assert_eq!(
        h.broker.success_count(&counters::today()).await.unwrap(),
        0
    );

    h.worker.close().await;
    h.broker.close().await;
}

#[tokio::test]
async fn failing_script_retries_until_schedule_exhausted() {
    let h = harness();
    // Every run appends a line, then fails. The log path is absolute since
    // scripts inherit the test process cwd.
    let log_path = h.dir.path().join("attempts.log");
    write_script(
        h.dir.path(),
        "flaky.sh",
        &format!("echo run >> {}\nexit 1", log_path.display()),
    );

    h.broker
        .submit(script_task("s3", "flaky.sh", "", vec![1, 1]))
        .await
        .unwrap();

    // Attempt 0 fails, one retry runs after back-off, then the schedule is
    // exhausted and the failure becomes permanent.
    wait_failure_count(&h.broker, 1, 20).await;

    let attempts = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(attempts.lines().count(), 2);

    // Recovery consumed the final result hash.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(
        h.broker.task_result("s3").await,
        Err(SchedulerError::ResultNotExist)
    ));
    assert_eq!(h.broker.pending_count().await.unwrap(), 0);

    h.worker.close().await;
    h.broker.close().await;
}

#[tokio::test]
async fn deferred_submission_is_not_claimable_early() {
    // No worker here: observe the pending set directly.
    let kvs: Arc<dyn Kvs> = Arc::new(MemoryKvs::new());
    let broker = Broker::new(kvs);

    let mut task = script_task("s4", "echo.sh", "", vec![]);
    task.start_time = chrono::Utc::now().timestamp() + 2;
    broker.submit(task).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(broker.pending_count().await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(broker.pending_count().await.unwrap(), 1);

    broker.close().await;
}
