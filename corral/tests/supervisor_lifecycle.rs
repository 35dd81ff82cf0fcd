//! Supervisor and worker lifecycle tests against an in-memory store.
//!
//! Covers retries through real workers, timeout reaping, recycling, crash
//! and hang recovery, reload, and both shutdown modes.

use std::sync::Arc;
use std::time::Duration;

use corral::{
    EnqueueOptions, FailureKind, JobStatus, JobStore, MemoryStore, QueueConfig, RetryPolicy,
    SupervisorBuilder, SupervisorConfig, SupervisorEvent, SupervisorEventBus, SupervisorHandle,
    TaskQueue, TaskRegistry, WorkerState,
};
use corral_testkit::{
    fast_queue_config, fast_supervisor_config, wait_for_pool, wait_for_status, Behaviour,
    FaultyStore, RecordingHandler,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Pool<S: JobStore> {
    queue: Arc<TaskQueue<S>>,
    handle: SupervisorHandle,
    join: JoinHandle<anyhow::Result<()>>,
    events: broadcast::Receiver<SupervisorEvent>,
}

fn start_on<S: JobStore>(
    store: Arc<S>,
    config: SupervisorConfig,
    queue_config: QueueConfig,
    registry: TaskRegistry,
) -> Pool<S> {
    let bus = SupervisorEventBus::new(1024);
    let events = bus.subscribe();
    let supervisor = SupervisorBuilder::new(config)
        .with_store(store)
        .with_registry(Arc::new(registry))
        .with_queue_config(queue_config)
        .with_events(bus)
        .build()
        .expect("valid supervisor");
    let queue = supervisor.queue();
    let (handle, join) = supervisor.spawn();
    Pool {
        queue,
        handle,
        join,
        events,
    }
}

fn start(config: SupervisorConfig, registry: TaskRegistry) -> Pool<MemoryStore> {
    start_on(Arc::new(MemoryStore::new()), config, fast_queue_config(), registry)
}

fn start_with_queue(
    config: SupervisorConfig,
    queue_config: QueueConfig,
    registry: TaskRegistry,
) -> Pool<MemoryStore> {
    start_on(Arc::new(MemoryStore::new()), config, queue_config, registry)
}

async fn next_matching(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    wait: Duration,
    predicate: impl Fn(&SupervisorEvent) -> bool,
) -> SupervisorEvent {
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected supervisor event")
}

async fn stop<S: JobStore>(pool: Pool<S>) {
    pool.handle.immediate_shutdown().await.unwrap();
    timeout(Duration::from_secs(5), pool.join)
        .await
        .expect("supervisor stops")
        .expect("supervisor task")
        .expect("supervisor result");
}

#[tokio::test]
async fn failing_echo_job_fails_after_three_attempts() {
    let echo = RecordingHandler::failing("echo is broken");
    let pool = start(
        fast_supervisor_config(2),
        TaskRegistry::new().with_handler("echo", echo.clone()),
    );

    let id = pool
        .queue
        .enqueue("echo", json!({ "x": 1 }), EnqueueOptions::default().with_max_retries(2))
        .await
        .unwrap();

    let job = wait_for_status(&pool.queue, id, JobStatus::Failed, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.retries_used, 2);
    let error = job.error.expect("failure recorded");
    assert_eq!(error.kind, FailureKind::Handler);
    assert!(error.message.contains("echo is broken"));

    let attempts = echo.attempts_for(id);
    assert_eq!(attempts.len(), 3);
    assert_eq!(
        attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts.iter().all(|a| a.payload == json!({ "x": 1 })));

    stop(pool).await;
}

#[tokio::test]
async fn started_job_past_its_timeout_is_reaped_and_requeued() {
    let sleeper = RecordingHandler::new(Behaviour::Sleep(Duration::from_secs(5)));
    let config = SupervisorConfig {
        // Long enough that the reaper, not the hang detector, recovers the job.
        worker_timeout_ms: 30_000,
        ..fast_supervisor_config(2)
    };
    let queue_config = fast_queue_config().with_retry(RetryPolicy::new(300, 300));
    let pool = start_with_queue(
        config,
        queue_config,
        TaskRegistry::new().with_handler("sleep", sleeper.clone()),
    );
    let mut jobs = pool.queue.subscribe();

    // No retries: a timed-out attempt is requeued all the same.
    let id = pool
        .queue
        .enqueue("sleep", json!(null), EnqueueOptions::default().with_timeout(1))
        .await
        .unwrap();

    timeout(Duration::from_secs(4), async {
        loop {
            let event = jobs.recv().await.unwrap();
            if event.job_id == id && matches!(event.kind, corral::JobEventKind::Reaped) {
                return;
            }
        }
    })
    .await
    .expect("job reaped after its timeout");
    sleeper.set_behaviour(Behaviour::Echo);

    // The second attempt runs on the other worker while the first is still asleep.
    let job = wait_for_status(&pool.queue, id, JobStatus::Finished, Duration::from_secs(3))
        .await
        .unwrap();
    let attempts = sleeper.attempts_for(id);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].attempt, 2);
    assert_ne!(attempts[0].worker_id, attempts[1].worker_id);
    assert_eq!(job.retries_used, 0);
    assert_eq!(job.recoveries, 1);
    assert_eq!(job.error.unwrap().kind, FailureKind::TimedOut);

    stop(pool).await;
}

#[tokio::test]
async fn worker_is_recycled_after_max_requests() {
    let echo = RecordingHandler::echo();
    let config = SupervisorConfig {
        max_requests: 3,
        max_requests_jitter: 0,
        ..fast_supervisor_config(1)
    };
    let mut pool = start(config, TaskRegistry::new().with_handler("echo", echo.clone()));

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(
            pool.queue
                .enqueue("echo", json!(n), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let recycled = next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::WorkerRecycled { .. })
    })
    .await;
    let SupervisorEvent::WorkerRecycled {
        worker_id: old_worker,
        requests_handled,
    } = recycled
    else {
        unreachable!()
    };
    assert_eq!(requests_handled, 3);

    for id in ids {
        wait_for_status(&pool.queue, id, JobStatus::Finished, Duration::from_secs(5))
            .await
            .unwrap();
    }

    let status = wait_for_pool(&pool.handle, Duration::from_secs(5), |status| {
        status.workers.len() == 1 && status.ready_count() == 1
    })
    .await
    .unwrap();
    let fresh = &status.workers[0];
    assert_ne!(fresh.worker_id, old_worker);
    assert!(fresh.requests_handled < 3);

    stop(pool).await;
}

#[tokio::test]
async fn crashed_worker_is_replaced_and_its_job_released() {
    let panicker = RecordingHandler::new(Behaviour::Panic("handler blew up".into()));
    let mut pool = start_with_queue(
        fast_supervisor_config(1),
        fast_queue_config().with_max_recoveries(1),
        TaskRegistry::new().with_handler("explode", panicker.clone()),
    );

    let id = pool
        .queue
        .enqueue("explode", json!(null), EnqueueOptions::default().with_max_retries(1))
        .await
        .unwrap();

    next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::WorkerCrashed { .. })
    })
    .await;

    // Released immediately and run again on the replacement worker, until
    // the recovery allowance is spent. The retry budget is left alone.
    let job = wait_for_status(&pool.queue, id, JobStatus::Failed, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.retries_used, 0);
    assert_eq!(job.recoveries, 1);
    assert_eq!(job.error.unwrap().kind, FailureKind::WorkerLost);
    assert_eq!(panicker.attempts_for(id).len(), 2);

    panicker.set_behaviour(Behaviour::Echo);
    let ok = pool
        .queue
        .enqueue("explode", json!("fine"), EnqueueOptions::default())
        .await
        .unwrap();
    let job = wait_for_status(&pool.queue, ok, JobStatus::Finished, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.result, Some(json!("fine")));

    stop(pool).await;
}

#[tokio::test]
async fn hung_worker_is_terminated() {
    let hang = RecordingHandler::new(Behaviour::Sleep(Duration::from_secs(30)));
    let config = SupervisorConfig {
        worker_timeout_ms: 300,
        ..fast_supervisor_config(1)
    };
    let mut pool = start_with_queue(
        config,
        fast_queue_config().with_max_recoveries(0),
        TaskRegistry::new().with_handler("hang", hang.clone()),
    );

    let id = pool
        .queue
        .enqueue("hang", json!(null), EnqueueOptions::default().with_max_retries(0))
        .await
        .unwrap();

    let event = next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::WorkerTimedOut { .. })
    })
    .await;
    let SupervisorEvent::WorkerTimedOut { silent_for, .. } = event else {
        unreachable!()
    };
    assert!(silent_for > Duration::from_millis(300));

    let job = wait_for_status(&pool.queue, id, JobStatus::Failed, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.error.unwrap().kind, FailureKind::WorkerLost);

    wait_for_pool(&pool.handle, Duration::from_secs(5), |status| status.ready_count() == 1)
        .await
        .unwrap();

    stop(pool).await;
}

#[tokio::test]
async fn heartbeating_handler_outlives_worker_timeout() {
    let patient = RecordingHandler::new(Behaviour::SleepWithHeartbeat {
        total: Duration::from_millis(800),
        interval: Duration::from_millis(50),
    });
    let config = SupervisorConfig {
        worker_timeout_ms: 300,
        ..fast_supervisor_config(1)
    };
    let pool = start(config, TaskRegistry::new().with_handler("patient", patient));

    let id = pool
        .queue
        .enqueue("patient", json!(7), EnqueueOptions::default().with_max_retries(0))
        .await
        .unwrap();
    let job = wait_for_status(&pool.queue, id, JobStatus::Finished, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.result, Some(json!(7)));

    stop(pool).await;
}

#[tokio::test]
async fn reload_keeps_target_workers_ready_throughout() {
    let target = 3;
    let echo = RecordingHandler::new(Behaviour::Sleep(Duration::from_millis(20)));
    let mut pool = start(
        fast_supervisor_config(target),
        TaskRegistry::new().with_handler("echo", echo),
    );

    next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::Ready { .. })
    })
    .await;
    for n in 0..20 {
        pool.queue
            .enqueue("echo", json!(n), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let sampler = {
        let handle = pool.handle.clone();
        tokio::spawn(async move {
            let mut min_ready = usize::MAX;
            for _ in 0..200 {
                min_ready = min_ready.min(handle.status().ready_count());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            min_ready
        })
    };

    pool.handle.reload().await.unwrap();
    next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::ReloadCompleted { generation: 1 })
    })
    .await;

    let min_ready = sampler.await.unwrap();
    assert!(min_ready >= target, "ready workers dipped to {min_ready}");

    let status = wait_for_pool(&pool.handle, Duration::from_secs(5), |status| {
        status.workers.len() == target && status.workers.iter().all(|w| w.generation == 1)
    })
    .await
    .unwrap();
    assert_eq!(status.reload_generation, 1);

    stop(pool).await;
}

#[tokio::test]
async fn graceful_shutdown_lets_running_jobs_finish() {
    let slow = RecordingHandler::new(Behaviour::Sleep(Duration::from_millis(300)));
    let mut pool = start(
        fast_supervisor_config(2),
        TaskRegistry::new().with_handler("slow", slow.clone()),
    );

    let a = pool
        .queue
        .enqueue("slow", json!("a"), EnqueueOptions::default())
        .await
        .unwrap();
    let b = pool
        .queue
        .enqueue("slow", json!("b"), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(slow.wait_for_count(2, Duration::from_secs(5)).await);

    pool.handle
        .graceful_shutdown(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let completed = next_matching(&mut pool.events, Duration::from_secs(5), |event| {
        matches!(event, SupervisorEvent::ShutdownCompleted { .. })
    })
    .await;
    assert!(matches!(
        completed,
        SupervisorEvent::ShutdownCompleted { forced_workers: 0 }
    ));
    timeout(Duration::from_secs(5), pool.join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    for id in [a, b] {
        assert_eq!(pool.queue.status(id).await.unwrap().status, JobStatus::Finished);
    }
}

#[tokio::test]
async fn immediate_shutdown_abandons_running_jobs() {
    let stuck = RecordingHandler::new(Behaviour::Sleep(Duration::from_secs(30)));
    let config = SupervisorConfig {
        worker_timeout_ms: 30_000,
        ..fast_supervisor_config(1)
    };
    let mut pool = start(config, TaskRegistry::new().with_handler("stuck", stuck.clone()));

    let id = pool
        .queue
        .enqueue("stuck", json!(null), EnqueueOptions::default().with_max_retries(0))
        .await
        .unwrap();
    assert!(stuck.wait_for_count(1, Duration::from_secs(5)).await);

    pool.handle.immediate_shutdown().await.unwrap();
    let completed = next_matching(&mut pool.events, Duration::from_secs(2), |event| {
        matches!(event, SupervisorEvent::ShutdownCompleted { .. })
    })
    .await;
    assert!(matches!(
        completed,
        SupervisorEvent::ShutdownCompleted { forced_workers: 1 }
    ));
    timeout(Duration::from_secs(2), pool.join)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Left queued for the next pool to pick up.
    let job = pool.queue.status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.recoveries, 1);
    assert_eq!(job.error.unwrap().kind, FailureKind::WorkerLost);
}

#[tokio::test]
async fn workers_survive_store_outage() {
    let store = Arc::new(FaultyStore::in_memory());
    let echo = RecordingHandler::echo();
    let pool = start_on(
        Arc::clone(&store),
        fast_supervisor_config(2),
        fast_queue_config(),
        TaskRegistry::new().with_handler("echo", echo),
    );
    wait_for_pool(&pool.handle, Duration::from_secs(5), |status| status.ready_count() == 2)
        .await
        .unwrap();

    store.set_unavailable(true);
    let before = store.calls("sorted_promote_due");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.calls("sorted_promote_due") > before, "workers kept polling");
    assert!(!pool.join.is_finished());
    assert_eq!(pool.handle.status().workers.len(), 2);

    store.set_unavailable(false);
    let id = pool
        .queue
        .enqueue("echo", json!("back"), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&pool.queue, id, JobStatus::Finished, Duration::from_secs(10))
        .await
        .unwrap();

    stop(pool).await;
}

#[tokio::test]
async fn scale_to_zero_and_back() {
    let pool = start(
        fast_supervisor_config(2),
        TaskRegistry::new().with_handler("echo", RecordingHandler::echo()),
    );
    wait_for_pool(&pool.handle, Duration::from_secs(5), |status| status.ready_count() == 2)
        .await
        .unwrap();

    pool.handle.scale(corral::ScaleRequest::To(0)).await.unwrap();
    wait_for_pool(&pool.handle, Duration::from_secs(5), |status| status.workers.is_empty())
        .await
        .unwrap();
    assert_eq!(pool.handle.available_capacity(), 0);

    let id = pool
        .queue
        .enqueue("echo", json!(1), EnqueueOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.queue.status(id).await.unwrap().status, JobStatus::Queued);

    pool.handle.scale(corral::ScaleRequest::By(1)).await.unwrap();
    wait_for_status(&pool.queue, id, JobStatus::Finished, Duration::from_secs(5))
        .await
        .unwrap();
    let status = pool.handle.status();
    assert_eq!(status.target_worker_count, 1);
    assert_eq!(status.count_in(WorkerState::Dead), 0);

    stop(pool).await;
}
