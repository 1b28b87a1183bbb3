//! Serial work queue
//!
//! Runs submitted futures one at a time in submission order on a single
//! background task. The queue can be suspended (queued work waits, running
//! work finishes) and cancelled (queued work is discarded, running work is
//! dropped at its next suspension point).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Job = BoxFuture<'static, ()>;

pub struct OperationQueue {
    name: String,
    sender: mpsc::UnboundedSender<(CancellationToken, Job)>,
    suspended: watch::Sender<bool>,
    /// Token for the current generation of submitted work
    generation: StdMutex<CancellationToken>,
    closed: AtomicBool,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, suspended: bool) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (suspended_tx, suspended_rx) = watch::channel(suspended);

        let worker = tokio::spawn(Self::run(name.clone(), receiver, suspended_rx));

        Self {
            name,
            sender,
            suspended: suspended_tx,
            generation: StdMutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
            worker: StdMutex::new(Some(worker)),
        }
    }

    async fn run(
        name: String,
        mut receiver: mpsc::UnboundedReceiver<(CancellationToken, Job)>,
        mut suspended: watch::Receiver<bool>,
    ) {
        while let Some((token, job)) = receiver.recv().await {
            while *suspended.borrow_and_update() {
                if suspended.changed().await.is_err() {
                    return;
                }
            }

            if token.is_cancelled() {
                continue;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    log::debug!("[{}] Operation cancelled while running", name);
                }
                _ = job => {}
            }
        }
    }

    pub fn add_operation<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            log::warn!("[{}] Ignoring operation added after close", self.name);
            return;
        }

        let token = self.cancellation_token();
        if self.sender.send((token, operation.boxed())).is_err() {
            log::warn!("[{}] Worker stopped; operation dropped", self.name);
        }
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.send_replace(suspended);
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Token cancelled by the next `cancel_all_operations`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.generation.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Discard queued work and cancel the running operation. The queue stays
    /// usable for work added afterwards.
    pub fn cancel_all_operations(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        generation.cancel();
        *generation = CancellationToken::new();
    }

    /// Cancel everything and refuse further work.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all_operations();
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            worker.abort();
        }
    }
}
