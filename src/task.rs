use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    thread,
};
use tracing::{error, info};

/// Cooperative stop flag checked between individual path operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum TaskMessage<T> {
    Completed(T),
    Failed(String),
}

pub struct TaskHandle<T> {
    label: String,
    rx: Receiver<TaskMessage<T>>,
    cancel: CancelToken,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Non-blocking check, for callers that poll from a UI loop.
    pub fn try_poll(&self) -> Option<TaskMessage<T>> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(TaskMessage::Failed(format!(
                "{} worker exited without reporting",
                self.label
            ))),
        }
    }

    pub fn wait(self) -> TaskMessage<T> {
        self.rx.recv().unwrap_or_else(|_| {
            TaskMessage::Failed(format!("{} worker exited without reporting", self.label))
        })
    }
}

/// Runs `work` on a worker thread and reports its result over a channel.
pub fn spawn<T, F>(label: &str, cancel: CancelToken, work: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> anyhow::Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let worker_label = label.to_string();
    let worker_cancel = cancel.clone();
    thread::spawn(move || {
        info!(task = %worker_label, "task started");
        let message = match work(worker_cancel) {
            Ok(value) => {
                info!(task = %worker_label, "task completed");
                TaskMessage::Completed(value)
            }
            Err(err) => {
                error!(task = %worker_label, error = %format!("{err:#}"), "task failed");
                TaskMessage::Failed(format!("{err:#}"))
            }
        };
        let _ = tx.send(message);
    });
    TaskHandle {
        label: label.to_string(),
        rx,
        cancel,
    }
}
