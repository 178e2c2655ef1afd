/// Integration tests for resilience library
use resilience::{with_cancel, DispatchError, Dispatcher, DispatcherConfig, TimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ==================== Dispatcher Tests ====================

#[tokio::test]
async fn test_waiters_proceed_fifo() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        max_in_flight: 1,
        max_queue: 8,
        wait_timeout: Duration::from_secs(5),
    });
    let cancel = CancellationToken::new();
    let held = dispatcher.acquire(&cancel).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..3 {
        let d = dispatcher.clone();
        let order = Arc::clone(&order);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = d.acquire(&cancel).await.unwrap();
            order.lock().await.push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }));
        // Enqueue in a known order.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatcher.stats().queued, 3);

    drop(held);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().await, vec![0, 1, 2]);
    assert_eq!(dispatcher.stats().in_flight, 0);
}

#[tokio::test]
async fn test_run_rejects_when_saturated() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        max_in_flight: 1,
        max_queue: 1,
        wait_timeout: Duration::from_millis(20),
    });
    let cancel = CancellationToken::new();
    let _held = dispatcher.acquire(&cancel).await.unwrap();

    let d = dispatcher.clone();
    let c = cancel.clone();
    let queued = tokio::spawn(async move { d.run(&c, async { 7 }).await });
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Queue is full now.
    let rejected = dispatcher.run(&cancel, async { 8 }).await;
    assert_eq!(rejected, Err(DispatchError::Overloaded));

    // The queued one times out while the slot stays held.
    assert_eq!(queued.await.unwrap(), Err(DispatchError::Overloaded));
}

#[tokio::test]
async fn test_release_hands_slot_to_waiter() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        max_in_flight: 1,
        max_queue: 1,
        wait_timeout: Duration::from_secs(5),
    });
    let cancel = CancellationToken::new();
    let held = dispatcher.acquire(&cancel).await.unwrap();

    let d = dispatcher.clone();
    let c = cancel.clone();
    let waiter = tokio::spawn(async move { d.run(&c, async { "served" }).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(held);

    assert_eq!(waiter.await.unwrap(), Ok("served"));
    assert_eq!(dispatcher.stats().in_flight, 0);
}

// ==================== Cancellation Tests ====================

#[test]
fn test_uncontended_acquire_is_immediate() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let cancel = CancellationToken::new();
    let permit = tokio_test::block_on(dispatcher.acquire(&cancel));
    tokio_test::assert_ok!(&permit);
    assert_eq!(dispatcher.stats().in_flight, 1);
    drop(permit);
    assert_eq!(dispatcher.stats().in_flight, 0);
}

#[tokio::test]
async fn test_cancel_interrupts_pending_call() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        trigger.cancel();
    });
    let result = with_cancel(&cancel, tokio::time::sleep(Duration::from_secs(5))).await;
    assert_eq!(tokio_test::assert_err!(result), TimeoutError::Cancelled);
}
