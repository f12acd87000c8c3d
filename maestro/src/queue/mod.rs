//! Event admission and scheduling.
//!
//! `submit` validates and admits an event without blocking the producer; the
//! queue is unbounded by design, with backpressure left to producers. A
//! single dispatcher task keeps one FIFO lane per conversation key and
//! guarantees at most one executor run in flight per key, while runs for
//! distinct keys proceed concurrently up to the configured worker bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::executor::PipelineExecutor;
use crate::types::{ConversationKey, Event, EventError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum executor runs in flight across all conversation keys.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("event queue is shut down")]
    ShutDown,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Runs dispatched and not yet finished (including ones waiting for a
    /// worker permit).
    pub in_flight: usize,
    /// Events admitted but not yet dispatched.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct StatsInner {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

impl StatsInner {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

enum DispatcherMsg {
    Submit(Event),
    Done { key: ConversationKey, success: bool },
    Shutdown(oneshot::Sender<()>),
}

/// Admits events and schedules executor runs.
pub struct EventQueue {
    tx: mpsc::UnboundedSender<DispatcherMsg>,
    stats: Arc<StatsInner>,
}

impl EventQueue {
    /// Spin up the dispatcher and worker pool.
    pub fn start(executor: Arc<PipelineExecutor>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsInner::default());
        let dispatcher = Dispatcher {
            executor,
            semaphore: Arc::new(Semaphore::new(config.workers.max(1))),
            lanes: HashMap::new(),
            busy: HashSet::new(),
            shutting_down: false,
            shutdown_acks: Vec::new(),
            stats: stats.clone(),
            tx: tx.clone(),
        };
        tokio::spawn(dispatcher.run(rx));
        Self { tx, stats }
    }

    /// Validate and admit an event. Returns immediately; never blocks the
    /// producer and never fails due to queue fullness.
    pub fn submit(&self, event: Event) -> Result<(), SubmitError> {
        event.validate()?;
        self.tx
            .send(DispatcherMsg::Submit(event))
            .map_err(|_| SubmitError::ShutDown)?;
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    /// Stop dispatching queued events and wait for in-flight runs to finish.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DispatcherMsg::Shutdown(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

struct Dispatcher {
    executor: Arc<PipelineExecutor>,
    semaphore: Arc<Semaphore>,
    lanes: HashMap<ConversationKey, VecDeque<Event>>,
    busy: HashSet<ConversationKey>,
    shutting_down: bool,
    shutdown_acks: Vec<oneshot::Sender<()>>,
    stats: Arc<StatsInner>,
    tx: mpsc::UnboundedSender<DispatcherMsg>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DispatcherMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DispatcherMsg::Submit(event) => {
                    let key = ConversationKey::for_event(&event);
                    self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                    self.stats.queued.fetch_add(1, Ordering::Relaxed);
                    self.lanes.entry(key.clone()).or_default().push_back(event);
                    self.try_dispatch(&key);
                }
                DispatcherMsg::Done { key, success } => {
                    self.busy.remove(&key);
                    self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
                    if success {
                        self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        // A failed run never stalls its lane: the next event
                        // for the key dispatches regardless.
                    }
                    self.try_dispatch(&key);
                    if self.shutting_down && self.busy.is_empty() {
                        break;
                    }
                }
                DispatcherMsg::Shutdown(ack) => {
                    self.shutting_down = true;
                    self.shutdown_acks.push(ack);
                    if self.busy.is_empty() {
                        break;
                    }
                }
            }
        }
        let undispatched: usize = self.lanes.values().map(VecDeque::len).sum();
        if undispatched > 0 {
            tracing::warn!(undispatched, "queue shut down with undispatched events");
        }
        for ack in self.shutdown_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    /// Dispatch the next event for a key unless one is already in flight.
    fn try_dispatch(&mut self, key: &ConversationKey) {
        if self.shutting_down || self.busy.contains(key) {
            return;
        }
        let Some(lane) = self.lanes.get_mut(key) else {
            return;
        };
        let Some(event) = lane.pop_front() else {
            return;
        };
        if lane.is_empty() {
            self.lanes.remove(key);
        }

        self.busy.insert(key.clone());
        self.stats.queued.fetch_sub(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);

        let executor = self.executor.clone();
        let semaphore = self.semaphore.clone();
        let tx = self.tx.clone();
        let key = key.clone();
        tokio::spawn(async move {
            // Worker bound: the run itself starts only once a permit frees up.
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let outcome = executor.run(event).await;
            let _ = tx.send(DispatcherMsg::Done {
                key,
                success: outcome.status.is_success(),
            });
        });
    }
}
