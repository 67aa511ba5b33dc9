//! End-to-end scenarios exercising the queue through its public API only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filequeue::{BincodeCodec, Config, Consumer, Expiration, Queue, RetryDelayAlgorithm, Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Job {
    id: u64,
}

struct AckAll {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Consumer<Job> for AckAll {
    async fn consume(&self, job: &Job) -> Verdict {
        self.seen.lock().unwrap().push(job.id);
        Verdict::Ack
    }
}

/// Fails a job's first `fail_times` attempts, then acks.
struct FlakyThenAck {
    fail_times: u32,
    attempts: Arc<Mutex<HashMap<u64, u32>>>,
}

impl Consumer<Job> for FlakyThenAck {
    async fn consume(&self, job: &Job) -> Verdict {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(job.id).or_insert(0);
        *count += 1;
        if *count <= self.fail_times {
            Verdict::FailRequeue
        } else {
            Verdict::Ack
        }
    }
}

struct AlwaysFailRequeue {
    attempt_times: Arc<Mutex<Vec<std::time::Instant>>>,
}

impl Consumer<Job> for AlwaysFailRequeue {
    async fn consume(&self, _job: &Job) -> Verdict {
        self.attempt_times.lock().unwrap().push(std::time::Instant::now());
        Verdict::FailRequeue
    }
}

struct RecordExpired {
    expired: Arc<AtomicBool>,
}

impl Expiration<Job> for RecordExpired {
    async fn expire(&self, _job: &Job) {
        self.expired.store(true, Ordering::SeqCst);
    }
}

struct SleepForever;

impl Consumer<Job> for SleepForever {
    async fn consume(&self, _job: &Job) -> Verdict {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Verdict::Ack
    }
}

struct SlowAck {
    delay: Duration,
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Consumer<Job> for SlowAck {
    async fn consume(&self, job: &Job) -> Verdict {
        tokio::time::sleep(self.delay).await;
        self.seen.lock().unwrap().push(job.id);
        Verdict::Ack
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// S1: a straight run with no failures preserves submission order and acks
/// everything.
#[tokio::test]
async fn s1_no_retries_preserves_fifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut config = Config::new("s1", dir.path());
    config.worker_count = 1;
    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(AckAll { seen: Arc::clone(&seen) }),
            None,
        )
        .unwrap(),
    );

    queue.start().await.unwrap();
    for id in 0..20u64 {
        queue.submit(Job { id }).await.unwrap();
    }

    assert!(wait_until(|| seen.lock().unwrap().len() == 20, Duration::from_secs(2)).await);
    assert_eq!(*seen.lock().unwrap(), (0..20u64).collect::<Vec<_>>());

    queue.stop().await.unwrap();
}

/// S2: a record that fails once is redelivered after the fixed delay and
/// then acked.
#[tokio::test]
async fn s2_fixed_retry_redelivers_after_delay() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(Mutex::new(HashMap::new()));

    let mut config = Config::new("s2", dir.path());
    config.worker_count = 1;
    config.max_tries = 0;
    config.retry_delay = Duration::from_millis(20);
    config.retry_delay_algorithm = RetryDelayAlgorithm::Fixed;

    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(FlakyThenAck {
                fail_times: 1,
                attempts: Arc::clone(&attempts),
            }),
            None,
        )
        .unwrap(),
    );

    queue.start().await.unwrap();
    queue.submit(Job { id: 1 }).await.unwrap();

    assert!(wait_until(|| attempts.lock().unwrap().get(&1).copied() == Some(2), Duration::from_secs(2)).await);

    queue.stop().await.unwrap();
}

/// S3: records that made it to the spill store survive an ungraceful
/// process exit and are redelivered once a fresh queue reopens the same
/// path.
#[tokio::test]
async fn s3_crash_recovery_redelivers_spilled_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    // Run the first queue instance on its own runtime/thread so it can be
    // torn down without a graceful `stop()`, simulating a crash.
    let crash_path = path.clone();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = Config::new("s3", &crash_path);
            config.worker_count = 1;
            config.max_queue_size = 10;

            let queue = Arc::new(Queue::new(config, Arc::new(BincodeCodec), Arc::new(SleepForever), None).unwrap());
            queue.start().await.unwrap();

            // The first submit is handed straight to the single (forever
            // busy) worker; later submits spill to disk once the fast path
            // is unavailable.
            for id in 0..5u64 {
                queue.submit(Job { id }).await.unwrap();
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        // Drops every spawned task, including the one wedged in
        // `SleepForever`, without running any shutdown path.
        rt.shutdown_timeout(Duration::from_millis(500));
    })
    .join()
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut config = Config::new("s3", &path);
    config.worker_count = 2;
    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(AckAll { seen: Arc::clone(&seen) }),
            None,
        )
        .unwrap(),
    );
    queue.start().await.unwrap();

    // At least the entries that had already reached the spill store before
    // the crash must be redelivered; the one held purely in-memory by the
    // stuck worker is not durable and may be lost.
    assert!(wait_until(|| seen.lock().unwrap().len() >= 3, Duration::from_secs(2)).await);

    queue.stop().await.unwrap();
}

/// S4: once the admission semaphore is exhausted, further non-blocking
/// submits fail fast with `QueueFull` instead of growing the queue
/// unboundedly.
#[tokio::test]
async fn s4_backpressure_rejects_once_full() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut config = Config::new("s4", dir.path());
    config.worker_count = 1;
    config.max_queue_size = 2;
    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(SlowAck {
                delay: Duration::from_millis(200),
                seen: Arc::clone(&seen),
            }),
            None,
        )
        .unwrap(),
    );

    queue.start().await.unwrap();
    queue.submit(Job { id: 1 }).await.unwrap();
    queue.submit(Job { id: 2 }).await.unwrap();

    let err = queue.submit(Job { id: 3 }).await.unwrap_err();
    assert!(matches!(err, filequeue::Error::QueueFull));
    assert_eq!(queue.available_permits(), 0);

    let err = queue
        .submit_timeout(Job { id: 4 }, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, filequeue::Error::QueueFull));

    queue.stop().await.unwrap();
}

/// S5: with exponential backoff, the delay between attempts roughly
/// doubles up to the configured cap, and the expiration callback fires
/// once `max_tries` is exhausted instead of the record retrying forever.
#[tokio::test]
async fn s5_exponential_backoff_then_expires() {
    let dir = tempfile::tempdir().unwrap();
    let attempt_times = Arc::new(Mutex::new(Vec::new()));
    let expired = Arc::new(AtomicBool::new(false));

    let mut config = Config::new("s5", dir.path());
    config.worker_count = 1;
    config.max_tries = 4;
    config.retry_delay = Duration::from_millis(15);
    config.max_retry_delay = Duration::from_millis(60);
    config.retry_delay_algorithm = RetryDelayAlgorithm::Exponential;

    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(AlwaysFailRequeue {
                attempt_times: Arc::clone(&attempt_times),
            }),
            Some(Arc::new(RecordExpired {
                expired: Arc::clone(&expired),
            })),
        )
        .unwrap(),
    );

    queue.start().await.unwrap();
    queue.submit(Job { id: 1 }).await.unwrap();

    assert!(wait_until(|| expired.load(Ordering::SeqCst), Duration::from_secs(2)).await);

    let times = attempt_times.lock().unwrap();
    assert_eq!(times.len(), 4);
    // Each gap should be no shorter than the configured delay for that
    // attempt (allowing scheduling slack, never shrinking).
    for i in 1..times.len() {
        assert!(times[i] - times[i - 1] >= Duration::from_millis(10));
    }
    drop(times);

    queue.stop().await.unwrap();
}

/// S6: `stop()` drains in-flight work before returning rather than
/// abandoning it, and completes in bounded time.
#[tokio::test]
async fn s6_shutdown_waits_for_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut config = Config::new("s6", dir.path());
    config.worker_count = 3;
    let queue = Arc::new(
        Queue::new(
            config,
            Arc::new(BincodeCodec),
            Arc::new(SlowAck {
                delay: Duration::from_millis(50),
                seen: Arc::clone(&seen),
            }),
            None,
        )
        .unwrap(),
    );

    queue.start().await.unwrap();
    for id in 0..5u64 {
        queue.submit(Job { id }).await.unwrap();
    }

    let stopped = tokio::time::timeout(Duration::from_secs(2), queue.stop()).await;
    assert!(stopped.is_ok(), "stop() should finish within the bounded timeout");
    stopped.unwrap().unwrap();

    assert_eq!(seen.lock().unwrap().len(), 5);

    let err = queue.submit(Job { id: 99 }).await.unwrap_err();
    assert!(matches!(err, filequeue::Error::Stopped));
}
