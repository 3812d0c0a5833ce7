//! Transaction Serializer: one worker thread per open store.
//!
//! The lane thread owns the [`StoreCore`] outright. Every read, write,
//! transaction, merge pass and lifecycle change is a task sent to it over an
//! unbounded channel and runs to completion before the next one starts, so
//! the snapshot is never observed mid-mutation and needs no lock.
//!
//! Each task reports back through a oneshot channel wrapped in a
//! [`Ticket`]. Dropping the ticket does not cancel the task.
//!
//! Whenever the queue runs dry the lane flushes pending journal writes,
//! so a burst of writes costs one file replace.

use crate::state::StoreCore;
use crate::error::{Result, StoreError};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

type Task = Box<dyn FnOnce(&mut StoreCore) + Send>;

/// Handle to the lane thread. Dropping it drains the queue, flushes and
/// joins the thread.
pub(crate) struct Lane {
    tx: Option<mpsc::UnboundedSender<Task>>,
    handle: Option<JoinHandle<()>>,
}

impl Lane {
    pub(crate) fn spawn(core: StoreCore) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = format!("folio-lane-{}", core.device_id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(core, rx))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue `work` behind everything already submitted.
    pub(crate) fn submit<T, F>(&self, work: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreCore) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let task: Task = Box::new(move |core| {
            let _ = reply.send(work(core));
        });
        if let Some(tx) = &self.tx {
            // A closed lane drops the task, and with it the reply sender,
            // so the ticket resolves to `Aborted`.
            let _ = tx.send(task);
        }
        Ticket { rx }
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            // A task that drops the last store handle must not join itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(mut core: StoreCore, mut rx: mpsc::UnboundedReceiver<Task>) {
    tracing::debug!(device = %core.device_id(), "Lane started");
    loop {
        let task = match rx.try_recv() {
            Ok(task) => task,
            Err(TryRecvError::Empty) => {
                core.flush_when_idle();
                match rx.blocking_recv() {
                    Some(task) => task,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task(&mut core))) {
            tracing::error!(
                device = %core.device_id(),
                panic = %panic_message(&*panic),
                "Store task panicked"
            );
        }
    }
    core.shutdown();
    tracing::debug!(device = %core.device_id(), "Lane stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// The pending result of a task submitted to the lane.
///
/// Await it from async code, or call [`Ticket::wait`] to block. Resolves to
/// [`StoreError::Aborted`] if the task panicked or the lane shut down first.
#[derive(Debug)]
pub struct Ticket<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Block until the task has run.
    ///
    /// This waits behind every task queued before it, so avoid calling it
    /// from latency-sensitive threads. Panics if called from inside an async
    /// runtime; await the ticket there instead.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(StoreError::Aborted))
    }
}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoreError::Aborted)))
    }
}
