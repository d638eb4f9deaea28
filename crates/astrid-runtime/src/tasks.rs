// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded worker pool for background tasks submitted by handlers.
//!
//! Callables run on the blocking thread pool so a CPU-bound task cannot
//! stall the agent loop. The returned [`TaskHandle`] resolves to the task's
//! result, or to [`RuntimeError::NotRunning`] once the pool is torn down.

use std::{
    any::Any,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::RuntimeError;

type BoxedResult = Box<dyn Any + Send>;
type Job = Box<dyn FnOnce() -> BoxedResult + Send>;

struct Inner {
    tx: Mutex<Option<mpsc::Sender<(Job, oneshot::Sender<BoxedResult>)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Cheap-to-clone handle onto the worker pool.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Start a pool with `workers` concurrent workers (at least one).
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<(Job, oneshot::Sender<BoxedResult>)>(workers * 2);
        let rx = Arc::new(AsyncMutex::new(rx));
        let handles = (0..workers)
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&rx))))
            .collect();
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(handles),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Submit a callable; waits when the submission queue is full.
    pub async fn enqueue<T, F>(&self, f: F) -> Result<TaskHandle<T>, RuntimeError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if !self.is_running() {
            return Err(RuntimeError::NotRunning("task manager"));
        }
        let tx = self
            .inner
            .tx
            .lock()
            .expect("task manager lock")
            .clone()
            .ok_or(RuntimeError::NotRunning("task manager"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || Box::new(f()) as BoxedResult);
        tx.send((job, reply_tx))
            .await
            .map_err(|_| RuntimeError::NotRunning("task manager"))?;
        Ok(TaskHandle {
            rx: reply_rx,
            _result: PhantomData,
        })
    }

    /// Stop accepting tasks, finish in-flight ones, and join the workers.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        // Dropping the sender closes the channel; workers drain and exit.
        self.inner.tx.lock().expect("task manager lock").take();
        let handles: Vec<JoinHandle<()>> =
            self.inner.workers.lock().expect("task manager lock").drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(rx: Arc<AsyncMutex<mpsc::Receiver<(Job, oneshot::Sender<BoxedResult>)>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some((job, reply)) = next else { break };
        match tokio::task::spawn_blocking(job).await {
            Ok(result) => {
                // Receiver may have been dropped; that is the caller's choice.
                let _ = reply.send(result);
            }
            Err(e) => {
                warn!("background task panicked: {e}");
                // Dropping `reply` signals the failure to the handle.
            }
        }
    }
}

/// Awaitable handle for a submitted task's result.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<BoxedResult>,
    _result: PhantomData<fn() -> T>,
}

impl<T: 'static> TaskHandle<T> {
    /// Wait for the task result. Fails with [`RuntimeError::NotRunning`]
    /// when the pool was torn down (or the task panicked) before replying.
    pub async fn result(self) -> Result<T, RuntimeError> {
        let boxed = self
            .rx
            .await
            .map_err(|_| RuntimeError::NotRunning("task manager"))?;
        boxed
            .downcast::<T>()
            .map(|v| *v)
            .map_err(|_| RuntimeError::Internal("task result type mismatch".into()))
    }
}
