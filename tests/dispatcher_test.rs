//! Integration tests for the dispatcher: routing, load bookkeeping, failure
//! isolation, timeouts, cancellation and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dispatchq::model::PoolSnapshot;
use dispatchq::{DispatchConfig, Dispatcher, DispatcherHandle, Error, Operation};
use tokio::sync::Semaphore;

fn config(workers: usize) -> DispatchConfig {
    DispatchConfig {
        workers,
        max_producers: 16,
        submission_capacity: 256,
        submit_timeout: None,
    }
}

fn spawn(workers: usize) -> DispatcherHandle<u64> {
    Dispatcher::spawn(&config(workers)).expect("dispatcher should start")
}

/// An operation that holds until `gate` hands out a permit.
fn gated(gate: &Arc<Semaphore>, value: u64) -> Operation<u64> {
    let gate = Arc::clone(gate);
    Operation::from_async(move || async move {
        let _permit = gate.acquire().await?;
        Ok::<_, anyhow::Error>(value)
    })
}

fn assert_consistent(snapshot: &PoolSnapshot) {
    assert!(snapshot.heap_ordered, "heap order violated: {snapshot:?}");
    assert!(snapshot.is_conserved(), "load not conserved: {snapshot:?}");
}

/// Poll until every completion signal has been processed.
async fn settled(handle: &DispatcherHandle<u64>) -> PoolSnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.dispatched == snapshot.completed {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("pool never settled");
}

// ---------------------------------------------------------------------------
// Basic submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_operation_result() {
    let handle = spawn(2);
    let value = handle.submit(|| async { Ok(42) }).await.unwrap();
    assert_eq!(value, 42);

    let snapshot = handle.shutdown().await.unwrap();
    assert_eq!(snapshot.dispatched, 1);
    assert_eq!(snapshot.completed, 1);
}

#[tokio::test]
async fn blocking_operations_run_off_the_runtime() {
    let handle = spawn(2);
    let value = handle
        .submit_blocking(|| {
            std::thread::sleep(Duration::from_millis(10));
            Ok(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn zero_workers_is_a_config_error() {
    let result = Dispatcher::<u64>::spawn(&config(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

// ---------------------------------------------------------------------------
// Routing and load bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_without_completions_stays_balanced() {
    let handle = spawn(3);
    let gate = Arc::new(Semaphore::new(0));

    let mut tickets = Vec::new();
    for i in 0..7 {
        tickets.push(handle.enqueue(gated(&gate, i)).await.unwrap());
    }

    // Commands are handled in order, so this sees all seven dispatches.
    let snapshot = handle.snapshot().await.unwrap();
    assert_consistent(&snapshot);
    assert_eq!(snapshot.dispatched, 7);
    assert_eq!(snapshot.completed, 0);
    assert_eq!(snapshot.total_pending(), 7);
    assert!(snapshot.spread() <= 1, "uneven: {snapshot:?}");

    gate.add_permits(100);
    for (i, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.wait().await.unwrap(), i as u64);
    }

    let last = handle.shutdown().await.unwrap();
    assert_consistent(&last);
    assert!(last.workers.iter().all(|w| w.pending == 0));
}

#[tokio::test]
async fn new_work_skips_the_busier_worker() {
    let handle = spawn(3);
    let gate = Arc::new(Semaphore::new(0));

    let first = handle.enqueue(gated(&gate, 1)).await.unwrap();
    let busy = handle.snapshot().await.unwrap();
    let loaded: Vec<_> = busy.workers.iter().filter(|w| w.pending == 1).collect();
    assert_eq!(loaded.len(), 1);
    let loaded = loaded[0].worker;

    let a = handle.enqueue(gated(&gate, 2)).await.unwrap();
    let b = handle.enqueue(gated(&gate, 3)).await.unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_consistent(&snapshot);
    // Both new items went to the two idle workers, never the loaded one.
    assert_eq!(snapshot.pending_of(loaded), Some(1));
    assert!(snapshot.workers.iter().all(|w| w.pending == 1));

    gate.add_permits(10);
    assert_eq!(first.wait().await.unwrap(), 1);
    assert_eq!(a.wait().await.unwrap(), 2);
    assert_eq!(b.wait().await.unwrap(), 3);
}

#[tokio::test]
async fn two_workers_drain_four_delayed_items() {
    let handle = spawn(2);
    let delay = Duration::from_millis(20);

    let mut tickets = Vec::new();
    for i in 0..4u64 {
        let op = Operation::from_async(move || async move {
            tokio::time::sleep(delay).await;
            Ok(i)
        });
        tickets.push(handle.enqueue(op).await.unwrap());
    }

    let mut results = Vec::new();
    for ticket in tickets {
        results.push(ticket.wait().await.unwrap());
    }
    assert_eq!(results, vec![0, 1, 2, 3]);

    let snapshot = settled(&handle).await;
    assert_consistent(&snapshot);
    assert_eq!(snapshot.dispatched, 4);
    assert!(snapshot.workers.iter().all(|w| w.pending == 0));
}

#[tokio::test]
async fn instant_items_spread_evenly_across_workers() {
    let (workers, items) = (4usize, 40u64);
    let handle = spawn(workers);

    let mut tickets = Vec::new();
    for i in 0..items {
        let op = Operation::from_async(move || async move { Ok(i) });
        tickets.push(handle.enqueue(op).await.unwrap());
    }
    for (i, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.wait().await.unwrap(), i as u64);
    }

    let last = handle.shutdown().await.unwrap();
    assert_consistent(&last);
    assert_eq!(last.dispatched, items);
    assert_eq!(last.workers.iter().map(|w| w.dispatched).sum::<u64>(), items);

    // Completions may land between dispatches in any order, so allow a
    // factor of two around the even share.
    let share = items / workers as u64;
    for w in &last.workers {
        assert!(
            (share / 2..=share * 2).contains(&w.dispatched),
            "{} got {} of {items}: {last:?}",
            w.worker,
            w.dispatched
        );
    }
}

#[tokio::test]
async fn idle_pool_rotates_through_workers() {
    let handle = spawn(3);

    // Every item completes before the next is submitted, so each dispatch
    // sees all workers idle.
    for i in 0..12u64 {
        assert_eq!(handle.submit(move || async move { Ok(i) }).await.unwrap(), i);
        settled(&handle).await;
    }

    let snapshot = settled(&handle).await;
    assert_consistent(&snapshot);
    for w in &snapshot.workers {
        assert_eq!(snapshot.dispatched_to(w.worker), Some(4), "{snapshot:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_conserve_load() {
    let handle = spawn(4);
    let producers: u64 = 8;
    let per_producer: u64 = 25;

    let mut tasks = Vec::new();
    for p in 0..producers {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let mut sum = 0;
            for i in 0..per_producer {
                let value = p * 1000 + i;
                sum += handle.submit(move || async move { Ok(value) }).await.unwrap();
                let snapshot = handle.snapshot().await.unwrap();
                assert_consistent(&snapshot);
            }
            sum
        }));
    }

    for (p, task) in tasks.into_iter().enumerate() {
        let expected: u64 = (0..per_producer).map(|i| p as u64 * 1000 + i).sum();
        assert_eq!(task.await.unwrap(), expected);
    }

    let last = handle.shutdown().await.unwrap();
    assert_consistent(&last);
    assert_eq!(last.dispatched, producers * per_producer);
    assert_eq!(last.completed, producers * per_producer);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operation_error_is_delivered_and_loop_survives() {
    let handle = spawn(1);

    let result = handle
        .submit(|| async { Err(anyhow::anyhow!("disk on fire")) })
        .await;
    match result {
        Err(Error::Operation(e)) => assert!(e.to_string().contains("disk on fire")),
        other => panic!("expected operation error, got {other:?}"),
    }

    assert_eq!(handle.submit(|| async { Ok(5) }).await.unwrap(), 5);
}

#[tokio::test]
async fn panicking_operation_does_not_kill_the_worker() {
    let handle = spawn(1);

    let result = handle
        .submit(|| async {
            if true {
                panic!("boom");
            }
            Ok(0)
        })
        .await;
    match result {
        Err(Error::Panicked(message)) => assert!(message.contains("boom")),
        other => panic!("expected panic error, got {other:?}"),
    }

    assert_eq!(handle.submit(|| async { Ok(9) }).await.unwrap(), 9);
    let snapshot = settled(&handle).await;
    assert_eq!(snapshot.completed, 2);
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_with_timeout_gives_up_and_frees_the_worker() {
    let handle = spawn(1);

    let result = handle
        .submit_with_timeout(
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(0)
            },
            Duration::from_millis(30),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    // The abandoned operation is aborted, so the worker is free again.
    let snapshot = settled(&handle).await;
    assert_eq!(snapshot.completed, 1);
    assert_eq!(handle.submit(|| async { Ok(3) }).await.unwrap(), 3);
}

#[tokio::test]
async fn configured_submit_timeout_applies_to_submit() {
    let mut cfg = config(1);
    cfg.submit_timeout = Some(Duration::from_millis(20));
    let handle: DispatcherHandle<u64> = Dispatcher::spawn(&cfg).unwrap();

    let result = handle
        .submit(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(0)
        })
        .await;
    assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(20)));
}

#[tokio::test]
async fn dropped_ticket_is_skipped_but_still_counted() {
    let handle = spawn(1);
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicBool::new(false));

    let blocker = handle.enqueue(gated(&gate, 1)).await.unwrap();

    let flag = Arc::clone(&ran);
    let skipped = handle
        .enqueue(Operation::from_async(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(2)
        }))
        .await
        .unwrap();
    // Make sure it was dispatched before the producer walks away.
    assert_eq!(handle.snapshot().await.unwrap().dispatched, 2);
    skipped.cancel();

    gate.add_permits(1);
    assert_eq!(blocker.wait().await.unwrap(), 1);

    let last = handle.shutdown().await.unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(last.dispatched, 2);
    assert_eq!(last.completed, 2);
    assert!(last.workers.iter().all(|w| w.pending == 0));
}

#[tokio::test]
async fn ticket_wait_timeout_cancels_queued_item() {
    let handle = spawn(1);
    let gate = Arc::new(Semaphore::new(0));

    let blocker = handle.enqueue(gated(&gate, 1)).await.unwrap();
    let waiting = handle.enqueue(gated(&gate, 2)).await.unwrap();
    let id = waiting.id();

    let result = waiting.wait_timeout(Duration::from_millis(20)).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "item {id} should time out");

    gate.add_permits(10);
    assert_eq!(blocker.wait().await.unwrap(), 1);

    let last = handle.shutdown().await.unwrap();
    assert_consistent(&last);
    assert_eq!(last.completed, 2);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_accepted_work_then_rejects() {
    let handle = spawn(2);

    let mut tickets = Vec::new();
    for i in 0..5u64 {
        let op = Operation::from_async(move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(i * 2)
        });
        tickets.push(handle.enqueue(op).await.unwrap());
    }

    let last = handle.shutdown().await.unwrap();
    assert_consistent(&last);
    assert_eq!(last.dispatched, 5);
    assert_eq!(last.completed, 5);

    for (i, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.wait().await.unwrap(), i as u64 * 2);
    }

    assert!(handle.is_closed());
    assert!(matches!(
        handle.submit(|| async { Ok(1) }).await,
        Err(Error::Closed)
    ));

    // Idempotent, and snapshots after shutdown report the final state.
    assert_eq!(handle.shutdown().await.unwrap(), last);
    assert_eq!(handle.snapshot().await.unwrap(), last);
}

#[tokio::test]
async fn dropping_every_handle_drains_the_pool() {
    let (dispatcher, handle) = Dispatcher::<u64>::new(&config(2)).unwrap();
    let task = tokio::spawn(dispatcher.run());

    let ticket = handle
        .enqueue(Operation::from_async(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(11)
        }))
        .await
        .unwrap();
    drop(handle);

    let last = task.await.unwrap();
    assert_eq!(last.dispatched, 1);
    assert_eq!(last.completed, 1);
    assert_eq!(ticket.wait().await.unwrap(), 11);
}
