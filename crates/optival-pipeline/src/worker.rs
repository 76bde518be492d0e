//! Background task execution.
//!
//! Optimization runs take seconds; the operator keeps working while
//! they do. [`spawn_task`] moves a closure onto a worker thread and
//! hands back a [`TaskHandle`] that can be polled from the control
//! loop or waited on. Cancellation is cooperative through the
//! [`CancelToken`] the closure receives, the same token the solvers
//! poll at every iteration boundary.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::debug;

use optival_optim::CancelToken;

/// Handle to a running background task.
///
/// Dropping the handle cancels the task and detaches the thread; the
/// worker notices at its next token check and exits on its own.
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: mpsc::Receiver<T>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

/// Run `task` on a dedicated thread.
///
/// The closure receives a [`CancelToken`] to forward into the solvers
/// it drives. Its return value, typically a `Result`, is delivered
/// through the handle.
pub fn spawn_task<T, F>(task: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> T + Send + 'static,
{
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let (sender, receiver) = mpsc::channel();
    let thread = thread::spawn(move || {
        // A dropped handle closes the receiver; the send failing then
        // is the expected way for the result to be discarded.
        let _ = sender.send(task(&token));
    });
    TaskHandle {
        receiver,
        cancel,
        thread: Some(thread),
    }
}

impl<T> TaskHandle<T> {
    /// Request cancellation. The task decides when to stop.
    pub fn cancel(&self) {
        debug!("cancellation requested for background task");
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Non-blocking poll. `None` until the task finishes; the result
    /// is yielded exactly once.
    pub fn try_result(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Block until the task finishes. `None` if the task panicked.
    pub fn wait(mut self) -> Option<T> {
        let result = self.receiver.recv().ok();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        result
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_the_task_result() {
        let handle = spawn_task(|_| (0..10).sum::<i32>());
        assert_eq!(handle.wait(), Some(45));
    }

    #[test]
    fn cancel_stops_a_long_running_task() {
        let handle = spawn_task(|cancel| {
            let mut iterations = 0_u64;
            while !cancel.is_cancelled() {
                iterations += 1;
                thread::sleep(Duration::from_millis(1));
            }
            iterations
        });
        thread::sleep(Duration::from_millis(10));
        handle.cancel();
        let iterations = handle.wait().unwrap();
        assert!(iterations > 0);
    }

    #[test]
    fn try_result_polls_without_blocking() {
        let mut handle = spawn_task(|_| {
            thread::sleep(Duration::from_millis(30));
            "done"
        });
        assert!(handle.try_result().is_none());

        let mut result = None;
        for _ in 0..200 {
            result = handle.try_result();
            if result.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(result, Some("done"));
        assert!(handle.is_finished());
    }

    #[test]
    fn dropping_the_handle_cancels_the_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let saw_stop = stopped.clone();
        let handle = spawn_task(move |cancel| {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            saw_stop.store(true, Ordering::SeqCst);
        });
        drop(handle);

        for _ in 0..500 {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_survives_a_panicking_task() {
        let handle = spawn_task(|_| -> i32 { panic!("worker blew up") });
        assert_eq!(handle.wait(), None);
    }
}
