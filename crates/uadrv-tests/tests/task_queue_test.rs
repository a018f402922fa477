//! Serial task queue under concurrent producers
//!
//! Run with: cargo test -p uadrv-tests --test task_queue_test

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::runtime::Handle;
use uadrv_opcua::task_queue::SerialTaskQueue;
use uadrv_opcua::UaDriverError;

/// Wait until every task pushed so far has run
async fn drained(queue: &SerialTaskQueue) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    queue.push(move || {
        async move {
            let _ = tx.send(());
            Ok(())
        }
        .boxed()
    });
    rx.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushes_never_overlap() {
    let queue = Arc::new(SerialTaskQueue::new("serial", Handle::current()));
    let running = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(Mutex::new(0usize));
    let started = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4usize)
        .map(|producer| {
            let queue = queue.clone();
            let running = running.clone();
            let overlaps = overlaps.clone();
            let started = started.clone();
            tokio::spawn(async move {
                for seq in 0..25usize {
                    let running = running.clone();
                    let overlaps = overlaps.clone();
                    let started = started.clone();
                    queue.push(move || {
                        async move {
                            if running.swap(true, Ordering::SeqCst) {
                                *overlaps.lock() += 1;
                            }
                            started.lock().push((producer, seq));
                            tokio::task::yield_now().await;
                            if seq % 5 == 0 {
                                tokio::time::sleep(Duration::from_millis(1)).await;
                            }
                            running.store(false, Ordering::SeqCst);
                            Ok(())
                        }
                        .boxed()
                    });
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    drained(&queue).await;

    assert_eq!(*overlaps.lock(), 0);
    let started = started.lock().clone();
    assert_eq!(started.len(), 100);
    for producer in 0..4 {
        let order: Vec<_> = started
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_tasks_start_in_submission_order() {
    let queue = SerialTaskQueue::new("fifo", Handle::current());
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10u32 {
        let order = order.clone();
        queue.push(move || {
            async move {
                // Later tasks finish faster; order must still follow submission
                tokio::time::sleep(Duration::from_millis(u64::from(10 - i))).await;
                order.lock().push(i);
                Ok(())
            }
            .boxed()
        });
    }
    drained(&queue).await;

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_failure_does_not_stop_the_queue() {
    let queue = SerialTaskQueue::new("failing", Handle::current());
    let failures = Arc::new(Mutex::new(Vec::new()));
    let seen = failures.clone();
    queue.on_failure(move |e| seen.lock().push(e.to_string()));

    let ran = Arc::new(AtomicBool::new(false));
    queue.push(|| async { Err(UaDriverError::NotConnected) }.boxed());
    let flag = ran.clone();
    queue.push(move || {
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    });
    drained(&queue).await;

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(*failures.lock(), vec!["Not connected".to_string()]);
}

#[tokio::test]
async fn test_close_drops_pending_and_runs_final_task_last() {
    let queue = SerialTaskQueue::new("closing", Handle::current());
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = order.clone();
    queue.push(move || {
        async move {
            let _ = release_rx.await;
            first.lock().push("first");
            Ok(())
        }
        .boxed()
    });
    let second = order.clone();
    queue.push(move || {
        async move {
            second.lock().push("second");
            Ok(())
        }
        .boxed()
    });

    // Let the first task start and block
    tokio::time::sleep(Duration::from_millis(10)).await;
    let last = order.clone();
    let done = queue.close(move || {
        async move {
            last.lock().push("final");
            Ok(())
        }
        .boxed()
    });
    release_tx.send(()).unwrap();
    done.await.unwrap().unwrap();

    assert_eq!(*order.lock(), vec!["first", "final"]);
    assert!(queue.is_closed());
    // A second close resolves without running anything
    queue
        .close(|| async { Err(UaDriverError::NotConnected) }.boxed())
        .await
        .unwrap()
        .unwrap();
}
