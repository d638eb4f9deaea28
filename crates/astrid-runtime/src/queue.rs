// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded concurrent FIFO queues bridging connections and the agent loop.
//!
//! Producers block when the queue is full; consumers block when it is empty.
//! Wakeups use the enable-before-check [`Notify`] pattern so no notification
//! is lost between releasing the lock and parking.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::sync::Notify;

use astrid_crypto::Address;
use astrid_envelope::{Envelope, EnvelopeContext, Message, ProtocolId, ProtocolRegistry};

use crate::error::{QueueError, RuntimeError};
use crate::multiplexer::RoutingTable;

// ── Generic bounded queue ─────────────────────────────────────────────────────

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

/// A bounded multi-producer multi-consumer FIFO. Cloning yields another
/// handle onto the same queue.
pub struct Queue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                not_empty: Notify::new(),
                not_full: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue `item`, waiting while the queue is at capacity.
    pub async fn put(&self, item: T) -> Result<(), QueueError> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            let notified = self.inner.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.inner.items.lock().expect("queue lock");
                if items.len() < self.inner.capacity {
                    items.push_back(item);
                    drop(items);
                    self.inner.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Dequeue, waiting until an item is available or the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Result<T, QueueError> {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.inner.items.lock().expect("queue lock");
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.inner.not_full.notify_waiters();
                    return Ok(item);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }
            notified.await;
        }
    }

    /// Dequeue with a deadline; signals [`QueueError::Empty`] on expiry.
    pub async fn get(&self, timeout: Duration) -> Result<T, QueueError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Empty),
        }
    }

    /// Non-blocking dequeue.
    pub fn try_get(&self) -> Option<T> {
        let mut items = self.inner.items.lock().expect("queue lock");
        let item = items.pop_front();
        drop(items);
        if item.is_some() {
            self.inner.not_full.notify_waiters();
        }
        item
    }

    /// Complete once at least one item is available, without removing it.
    /// Also completes when the queue is closed so waiters do not hang.
    pub async fn async_wait(&self) {
        loop {
            let notified = self.inner.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.empty() || self.inner.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    pub fn empty(&self) -> bool {
        self.inner.items.lock().expect("queue lock").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Close the queue: pending and future `put`s fail, consumers drain the
    /// remaining items and then see [`QueueError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.not_empty.notify_waiters();
        self.inner.not_full.notify_waiters();
    }
}

/// The agent's inbound queue.
pub type Inbox = Queue<Envelope>;

// ── Outbox ────────────────────────────────────────────────────────────────────

/// The agent's outbound queue. `put` performs the routability check
/// synchronously: an envelope is only accepted if the multiplexer's routing
/// rules resolve it to a connection, so producers learn about routing errors
/// immediately rather than after the fact.
#[derive(Clone)]
pub struct Outbox {
    queue: Queue<Envelope>,
    routing: Arc<RoutingTable>,
    sender: Address,
    registry: Arc<ProtocolRegistry>,
}

impl Outbox {
    pub fn new(
        capacity: usize,
        sender: Address,
        registry: Arc<ProtocolRegistry>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        Self {
            queue: Queue::new(capacity),
            routing,
            sender,
            registry,
        }
    }

    /// Enqueue an envelope for transmission.
    pub async fn put(&self, env: Envelope) -> Result<(), RuntimeError> {
        self.routing.resolve(&env)?;
        self.queue
            .put(env)
            .await
            .map_err(|_| RuntimeError::NotRunning("outbox"))
    }

    /// Encode `message` under `protocol_id` and enqueue it in an envelope
    /// from this agent's identity.
    pub async fn put_message(
        &self,
        to: Address,
        protocol_id: &ProtocolId,
        message: &dyn Message,
        context: Option<EnvelopeContext>,
    ) -> Result<(), RuntimeError> {
        let codec = self.registry.lookup(protocol_id)?;
        let bytes = codec.encode(message)?;
        let mut env = Envelope::new(to, self.sender.clone(), protocol_id.clone(), bytes);
        if let Some(context) = context {
            env = env.with_context(context);
        }
        self.put(env).await
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.empty()
    }

    pub fn close(&self) {
        self.queue.close()
    }

    /// The raw queue, for the multiplexer's send loop.
    pub(crate) fn queue(&self) -> Queue<Envelope> {
        self.queue.clone()
    }
}
