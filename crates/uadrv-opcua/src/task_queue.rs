//! Serial execution of asynchronous tasks
//!
//! A [`SerialTaskQueue`] runs submitted tasks one at a time, in submission
//! order, on a shared Tokio runtime. There is no dedicated thread: the first
//! push on an idle queue spawns a worker that drains the queue and exits once
//! it is empty. Taking the next task and marking the queue idle happen under
//! the same lock, so no task is skipped, run twice, or run alongside another.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::UaDriverError;

/// Future produced by a queued task
pub type TaskFuture = BoxFuture<'static, Result<(), UaDriverError>>;

/// Invoked with the error of every failed task until the queue is closed
pub type FailureHandler = Arc<dyn Fn(UaDriverError) + Send + Sync>;

type TaskFactory = Box<dyn FnOnce() -> TaskFuture + Send>;

struct QueueState {
    pending: VecDeque<TaskFactory>,
    running: bool,
    closed: bool,
    on_failure: Option<FailureHandler>,
}

/// FIFO queue executing at most one task at a time
pub struct SerialTaskQueue {
    name: String,
    state: Arc<Mutex<QueueState>>,
    runtime: Handle,
}

impl SerialTaskQueue {
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: false,
                closed: false,
                on_failure: None,
            })),
            runtime,
        }
    }

    /// Set the handler called when a task fails
    pub fn on_failure(&self, handler: impl Fn(UaDriverError) + Send + Sync + 'static) {
        let mut state = self.state.lock();
        if !state.closed {
            state.on_failure = Some(Arc::new(handler));
        }
    }

    /// Enqueue a task; ignored once the queue is closed
    pub fn push<F>(&self, factory: F)
    where
        F: FnOnce() -> TaskFuture + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            debug!(queue = %self.name, "Task pushed after close, dropped");
            return;
        }
        state.pending.push_back(Box::new(factory));
        self.start_worker(&mut state);
    }

    /// Close the queue
    ///
    /// Drops every task that has not started, disables the failure handler,
    /// and runs `final_task` after the task currently in flight (if any).
    /// The returned receiver yields the final task's result. Closing an
    /// already closed queue runs nothing and resolves immediately.
    pub fn close<F>(&self, final_task: F) -> oneshot::Receiver<Result<(), UaDriverError>>
    where
        F: FnOnce() -> TaskFuture + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            let _ = tx.send(Ok(()));
            return rx;
        }

        state.closed = true;
        state.on_failure = None;
        let dropped = state.pending.len();
        state.pending.clear();
        if dropped > 0 {
            debug!(queue = %self.name, dropped, "Discarded pending tasks on close");
        }

        state.pending.push_back(Box::new(move || {
            async move {
                let result = final_task().await;
                let _ = tx.send(result);
                Ok(())
            }
            .boxed()
        }));
        self.start_worker(&mut state);
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a task is running or waiting
    pub fn is_busy(&self) -> bool {
        let state = self.state.lock();
        state.running || !state.pending.is_empty()
    }

    fn start_worker(&self, state: &mut QueueState) {
        if state.running {
            return;
        }
        state.running = true;
        let shared = self.state.clone();
        let name = self.name.clone();
        self.runtime.spawn(Self::drain(shared, name));
    }

    async fn drain(state: Arc<Mutex<QueueState>>, name: String) {
        loop {
            let next = {
                let mut guard = state.lock();
                match guard.pending.pop_front() {
                    Some(task) => task,
                    None => {
                        guard.running = false;
                        return;
                    }
                }
            };

            let outcome = AssertUnwindSafe(async move { next().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(UaDriverError::TaskPanicked(panic_message(&*panic))));

            if let Err(e) = outcome {
                let handler = {
                    let guard = state.lock();
                    if guard.closed {
                        None
                    } else {
                        guard.on_failure.clone()
                    }
                };
                match handler {
                    Some(handler) => handler(e),
                    None => debug!(queue = %name, error = %e, "Task failed"),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.pending.is_empty() {
            error!(
                queue = %self.name,
                pending = state.pending.len(),
                "Task queue dropped with pending tasks"
            );
        }
        state.closed = true;
        state.on_failure = None;
        state.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn queue() -> SerialTaskQueue {
        SerialTaskQueue::new("test", Handle::current())
    }

    fn exploding() -> TaskFuture {
        async {
            if true {
                panic!("boom");
            }
            Ok(())
        }
        .boxed()
    }

    async fn settle(queue: &SerialTaskQueue) {
        while queue.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_never_overlap_and_run_in_order() {
        let queue = Arc::new(queue());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let order = order.clone();
            queue.push(move || {
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    order.lock().push(i);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
        }
        settle(&queue).await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failure_does_not_halt_queue() {
        let queue = queue();
        let failures = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = failures.clone();
        queue.on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.push(|| async { Err(UaDriverError::NotConnected) }.boxed());
        queue.push(exploding);
        let r = ran.clone();
        queue.push(move || {
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });
        settle(&queue).await;

        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_discards_pending_and_runs_final() {
        let queue = queue();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicUsize::new(0));

        let counter = failures.clone();
        queue.on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Nothing runs until this task yields to the runtime
        for name in ["first", "second"] {
            let ran = ran.clone();
            queue.push(move || {
                async move {
                    ran.lock().push(name);
                    Err(UaDriverError::NotConnected)
                }
                .boxed()
            });
        }

        let r = ran.clone();
        let done = queue.close(move || {
            async move {
                r.lock().push("final");
                Ok(())
            }
            .boxed()
        });
        queue.push(exploding);

        assert!(done.await.unwrap().is_ok());
        assert_eq!(*ran.lock(), vec!["final"]);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_close_waits_for_running_task() {
        let queue = queue();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let r = ran.clone();
        queue.push(move || {
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(10)).await;
                r.lock().push("running");
                Ok(())
            }
            .boxed()
        });
        started_rx.await.unwrap();

        let r = ran.clone();
        let done = queue.close(move || {
            async move {
                r.lock().push("final");
                Ok(())
            }
            .boxed()
        });
        done.await.unwrap().unwrap();

        assert_eq!(*ran.lock(), vec!["running", "final"]);
    }

    #[tokio::test]
    async fn test_second_close_resolves_immediately() {
        let queue = queue();
        queue
            .close(|| async { Ok(()) }.boxed())
            .await
            .unwrap()
            .unwrap();
        let second = queue.close(|| async { Err(UaDriverError::NotConnected) }.boxed());
        assert!(second.await.unwrap().is_ok());
    }
}
