//! Timer-based debounce: run an async action once activity has been quiet for `delay`.

use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

enum Command {
    Trigger,
    Flush(oneshot::Sender<()>),
}

/// Coalesces bursts of triggers into a single action run.
///
/// Each `trigger` pushes the deadline back to `now + delay`. Dropping every handle
/// (or calling [`Debouncer::shutdown`]) runs a pending action one last time.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(delay: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut pending = false;
            let mut deadline = Instant::now();
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Trigger) => {
                            pending = true;
                            deadline = Instant::now() + delay;
                        }
                        Some(Command::Flush(ack)) => {
                            if pending {
                                pending = false;
                                action().await;
                            }
                            let _ = ack.send(());
                        }
                        None => {
                            if pending {
                                debug!("Debouncer: running pending action before shutdown");
                                action().await;
                            }
                            break;
                        }
                    },
                    _ = sleep_until(deadline), if pending => {
                        pending = false;
                        action().await;
                    }
                }
            }
        });
        Self { tx, task }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(Command::Trigger);
    }

    /// Run a pending action now and wait for it.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Run a pending action and stop.
    pub async fn shutdown(self) {
        let Self { tx, task } = self;
        drop(tx);
        let _ = task.await;
    }
}
