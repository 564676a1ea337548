//! Pending-request registry.
//!
//! The rendezvous between HTTP handlers and asynchronous bus replies.
//! Handlers register a waiter keyed by correlation id before publishing;
//! the response subscriber feeds arriving envelopes back through
//! [`PendingRegistry::complete`]. Terminal transitions (reply, final
//! chunk, timeout, cancellation) are mutually exclusive: whichever
//! removes the waiter from the map first wins, and later arrivals for
//! that id are dropped with a counter bump.
//!
//! Stream waiters own the reassembly buffer and push in-order chunks
//! into a bounded channel; a full channel makes `complete` wait, which
//! keeps the bus delivery unsettled and lets session flow control
//! throttle the publisher.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use courier_bus::{ChunkType, Envelope, EnvelopeBody};
use courier_common::CorrelationId;

use crate::jsonrpc::codes;
use crate::sse::reassembly::{Push, ReassemblyBuffer};
use crate::sse::{StreamChunk, StreamEvent};

/// Why a waiter ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Deadline elapsed before the terminal event.
    Timeout,
    /// The caller went away (client disconnect or shutdown).
    Cancelled,
}

/// Terminal outcome of a single-shot waiter.
#[derive(Debug)]
pub enum SingleOutcome {
    Reply(Envelope),
    Error(WaitError),
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each stream's ordered channel (high-water mark).
    pub stream_buffer: usize,
    /// Maximum out-of-order window per stream.
    pub reorder_window: usize,
    /// Sweeper wake-up interval.
    pub sweep_interval: Duration,
    /// How long terminated correlations are remembered for late-arrival
    /// dedup before eviction.
    pub terminated_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stream_buffer: 64,
            reorder_window: 256,
            sweep_interval: Duration::from_millis(250),
            terminated_grace: Duration::from_secs(30),
        }
    }
}

/// Observable drop/expiry counters.
#[derive(Debug, Default)]
pub struct RegistryCounters {
    late_drops: AtomicU64,
    unknown_drops: AtomicU64,
    kind_mismatches: AtomicU64,
    duplicate_chunks: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub late_drops: u64,
    pub unknown_drops: u64,
    pub kind_mismatches: u64,
    pub duplicate_chunks: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

enum Waiter {
    Single(SingleEntry),
    Stream(Arc<Mutex<StreamState>>),
}

struct SingleEntry {
    tx: oneshot::Sender<SingleOutcome>,
    deadline: Instant,
}

struct StreamState {
    tx: Option<mpsc::Sender<StreamEvent>>,
    reassembly: ReassemblyBuffer,
    idle_deadline: Instant,
    idle_timeout: Duration,
    done: bool,
}

/// The registry proper. Shared behind an `Arc`.
pub struct PendingRegistry {
    cfg: RegistryConfig,
    waiters: DashMap<CorrelationId, Waiter>,
    terminated: DashMap<CorrelationId, Instant>,
    counters: RegistryCounters,
}

impl PendingRegistry {
    pub fn new(cfg: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            waiters: DashMap::new(),
            terminated: DashMap::new(),
            counters: RegistryCounters::default(),
        })
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            late_drops: self.counters.late_drops.load(Ordering::Relaxed),
            unknown_drops: self.counters.unknown_drops.load(Ordering::Relaxed),
            kind_mismatches: self.counters.kind_mismatches.load(Ordering::Relaxed),
            duplicate_chunks: self.counters.duplicate_chunks.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Number of live waiters; used by tests and shutdown draining.
    pub fn open_waiters(&self) -> usize {
        self.waiters.len()
    }

    /// Register a single-shot waiter. The returned handle resolves with
    /// the reply envelope, a timeout, or a cancellation; dropping it
    /// before resolution cancels the waiter.
    pub fn register_single(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> SingleWaiter {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(
            correlation_id.clone(),
            Waiter::Single(SingleEntry {
                tx,
                deadline: Instant::now() + timeout,
            }),
        );
        trace!(correlation_id = %correlation_id, "single waiter registered");
        SingleWaiter {
            rx,
            guard: CancelGuard {
                registry: Arc::clone(self),
                correlation_id,
            },
        }
    }

    /// Register a stream waiter. The returned handle yields ordered
    /// [`StreamEvent`]s; dropping it cancels the waiter and releases
    /// bus back-pressure.
    pub fn register_stream(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
        idle_timeout: Duration,
    ) -> StreamWaiter {
        let (tx, rx) = mpsc::channel(self.cfg.stream_buffer);
        let state = StreamState {
            tx: Some(tx),
            reassembly: ReassemblyBuffer::new(self.cfg.reorder_window),
            idle_deadline: Instant::now() + idle_timeout,
            idle_timeout,
            done: false,
        };
        self.waiters.insert(
            correlation_id.clone(),
            Waiter::Stream(Arc::new(Mutex::new(state))),
        );
        trace!(correlation_id = %correlation_id, "stream waiter registered");
        StreamWaiter {
            rx,
            guard: CancelGuard {
                registry: Arc::clone(self),
                correlation_id,
            },
        }
    }

    /// Route an arriving reply or chunk envelope to its waiter. Unknown
    /// or late ids are dropped (and counted); this never fails into the
    /// caller, which settles the bus delivery after it returns.
    pub async fn complete(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id.clone();
        match &envelope.body {
            EnvelopeBody::Reply { .. } => self.complete_single(correlation_id, envelope),
            EnvelopeBody::StreamChunk { .. } => {
                self.complete_stream(correlation_id, envelope).await
            }
            EnvelopeBody::Request { .. } => {
                warn!(correlation_id = %correlation_id, "request envelope on response path, dropping");
                self.counters.kind_mismatches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn complete_single(&self, correlation_id: CorrelationId, envelope: Envelope) {
        let removed = self
            .waiters
            .remove_if(&correlation_id, |_, waiter| matches!(waiter, Waiter::Single(_)));
        if let Some((_, Waiter::Single(entry))) = removed {
            self.mark_terminated(&correlation_id);
            if entry.tx.send(SingleOutcome::Reply(envelope)).is_err() {
                debug!(correlation_id = %correlation_id, "reply arrived after caller left");
            }
        } else if self.waiters.contains_key(&correlation_id) {
            // A stream waiter is registered under this id.
            warn!(correlation_id = %correlation_id, "non-stream reply for stream waiter, dropping");
            self.counters.kind_mismatches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.drop_unmatched(&correlation_id);
        }
    }

    async fn complete_stream(&self, correlation_id: CorrelationId, envelope: Envelope) {
        let EnvelopeBody::StreamChunk {
            sequence,
            payload,
            stream_metadata,
            ..
        } = envelope.body
        else {
            return;
        };

        let state = match self.waiters.get(&correlation_id) {
            Some(entry) => match entry.value() {
                Waiter::Stream(state) => Arc::clone(state),
                Waiter::Single(_) => {
                    warn!(correlation_id = %correlation_id, "stream chunk for single waiter, dropping");
                    self.counters.kind_mismatches.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
            None => {
                self.drop_unmatched(&correlation_id);
                return;
            }
        };

        let mut state = state.lock().await;
        if state.done {
            self.counters.late_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        state.idle_deadline = Instant::now() + state.idle_timeout;

        let chunk = StreamChunk {
            sequence,
            payload,
            metadata: stream_metadata,
        };
        match state.reassembly.push(chunk) {
            Push::Ready(chunks) => {
                for chunk in chunks {
                    if chunk.metadata.chunk_type == ChunkType::End {
                        self.finish_stream(&correlation_id, &mut state, StreamEvent::End)
                            .await;
                        return;
                    }
                    let Some(tx) = state.tx.clone() else {
                        return;
                    };
                    // Bounded send: waiting here is the back-pressure
                    // that keeps the bus delivery unsettled.
                    if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                        debug!(correlation_id = %correlation_id, "stream consumer gone");
                        self.finish_stream(&correlation_id, &mut state, StreamEvent::End)
                            .await;
                        return;
                    }
                }
            }
            Push::Duplicate => {
                trace!(correlation_id = %correlation_id, sequence, "duplicate chunk dropped");
                self.counters.duplicate_chunks.fetch_add(1, Ordering::Relaxed);
            }
            Push::Buffered => {
                trace!(correlation_id = %correlation_id, sequence, "chunk parked out of order");
            }
            Push::WindowExceeded => {
                warn!(correlation_id = %correlation_id, sequence, "out-of-order window exceeded");
                self.finish_stream(
                    &correlation_id,
                    &mut state,
                    StreamEvent::Error {
                        code: codes::INTERNAL_ERROR,
                        message: "Stream out-of-order window exceeded".to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Send a terminal event, close the channel and forget the waiter.
    async fn finish_stream(
        &self,
        correlation_id: &CorrelationId,
        state: &mut StreamState,
        event: StreamEvent,
    ) {
        state.done = true;
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(event).await;
        }
        self.waiters.remove(correlation_id);
        self.mark_terminated(correlation_id);
    }

    /// Cancel a waiter (client disconnect, shutdown). Synchronous so it
    /// can run from `Drop`. Later arrivals for the id are dropped.
    pub fn cancel(&self, correlation_id: &CorrelationId, reason: &'static str) {
        let Some((_, waiter)) = self.waiters.remove(correlation_id) else {
            return;
        };
        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        self.mark_terminated(correlation_id);
        debug!(correlation_id = %correlation_id, reason, "waiter cancelled");
        match waiter {
            Waiter::Single(entry) => {
                let _ = entry.tx.send(SingleOutcome::Error(WaitError::Cancelled));
            }
            Waiter::Stream(state) => {
                // Closing the channel is the cancellation signal; the
                // state is marked done so in-flight completes drop out.
                if let Ok(mut state) = state.try_lock() {
                    state.done = true;
                    state.tx = None;
                }
            }
        }
    }

    /// Cancel everything; used on shutdown.
    pub fn cancel_all(&self, reason: &'static str) {
        let ids: Vec<CorrelationId> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id, reason);
        }
    }

    /// Spawn the background sweeper enforcing deadlines and evicting the
    /// terminated-correlation dedup set.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.cfg.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.sweep(Instant::now()).await;
            }
        })
    }

    /// One sweeper pass. Public for deterministic tests.
    pub async fn sweep(&self, now: Instant) {
        // Expired singles.
        let mut expired_singles = Vec::new();
        let mut expired_streams = Vec::new();
        for entry in self.waiters.iter() {
            match entry.value() {
                Waiter::Single(single) => {
                    if single.deadline <= now {
                        expired_singles.push(entry.key().clone());
                    }
                }
                Waiter::Stream(state) => {
                    // A locked state is mid-chunk, hence not idle.
                    if let Ok(state) = state.try_lock() {
                        if !state.done && state.idle_deadline <= now {
                            expired_streams.push(entry.key().clone());
                        }
                    }
                }
            }
        }

        for id in expired_singles {
            let removed = self
                .waiters
                .remove_if(&id, |_, w| matches!(w, Waiter::Single(s) if s.deadline <= now));
            if let Some((_, Waiter::Single(entry))) = removed {
                debug!(correlation_id = %id, "single waiter timed out");
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.mark_terminated(&id);
                let _ = entry.tx.send(SingleOutcome::Error(WaitError::Timeout));
            }
        }

        for id in expired_streams {
            let state = match self.waiters.get(&id) {
                Some(entry) => match entry.value() {
                    Waiter::Stream(state) => Arc::clone(state),
                    Waiter::Single(_) => continue,
                },
                None => continue,
            };
            // A busy state is mid-chunk; its idle deadline was just
            // refreshed, so skip it rather than wait.
            let Ok(mut state) = state.try_lock() else {
                continue;
            };
            if state.done || state.idle_deadline > now {
                continue;
            }
            debug!(correlation_id = %id, "stream waiter idle-timed out");
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            self.finish_stream(
                &id,
                &mut state,
                StreamEvent::Error {
                    code: codes::INTERNAL_ERROR,
                    message: "Request timeout".to_string(),
                },
            )
            .await;
        }

        // Evict terminated ids past the grace window.
        let horizon = now.checked_sub(self.cfg.terminated_grace);
        if let Some(horizon) = horizon {
            self.terminated.retain(|_, at| *at > horizon);
        }
    }

    fn mark_terminated(&self, correlation_id: &CorrelationId) {
        self.terminated
            .insert(correlation_id.clone(), Instant::now());
    }

    fn drop_unmatched(&self, correlation_id: &CorrelationId) {
        if self.terminated.contains_key(correlation_id) {
            debug!(correlation_id = %correlation_id, "late arrival for terminated waiter, dropping");
            self.counters.late_drops.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(correlation_id = %correlation_id, "arrival for unknown correlation, dropping");
            self.counters.unknown_drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Cancels the waiter when the owning handler goes away.
struct CancelGuard {
    registry: Arc<PendingRegistry>,
    correlation_id: CorrelationId,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        // A no-op if the waiter already reached a terminal state.
        self.registry.cancel(&self.correlation_id, "client-gone");
    }
}

/// Handle to a single-shot waiter.
pub struct SingleWaiter {
    rx: oneshot::Receiver<SingleOutcome>,
    guard: CancelGuard,
}

impl SingleWaiter {
    /// Wait for the terminal outcome.
    pub async fn wait(self) -> SingleOutcome {
        let SingleWaiter { rx, guard } = self;
        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => SingleOutcome::Error(WaitError::Cancelled),
        };
        drop(guard); // cancel is a no-op by now
        outcome
    }
}

/// Handle to a stream waiter; yields ordered events.
pub struct StreamWaiter {
    rx: mpsc::Receiver<StreamEvent>,
    #[allow(dead_code)]
    guard: CancelGuard,
}

impl StreamWaiter {
    /// Next ordered event; `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}
