//! Replica runtime contract.
//!
//! A protocol module implements [`Replica`] and is otherwise opaque to the
//! kernel. The four things a protocol needs to do during a dispatch (`send`,
//! `register_timer`, `clock`, `log`) are rendered as methods on a
//! [`ReplicaIo`] handle passed into `on_message`/`on_timer`, rather than as
//! bare closures: a replica may call any of them any number of times during
//! one dispatch, and a method-bearing handle borrow-checks cleanly where
//! four captured `FnMut` closures would fight the borrow checker for no
//! behavioral gain. Everything queued on the handle becomes visible to the
//! rest of the kernel only after the dispatch returns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::SimTime;
use crate::transport::{Destination, Packet};

/// Opaque identifier for one participant. Valid ids are `1..=N`; by
/// convention (not enforced by the kernel) `1..=N-f` are correct replicas
/// and `N-f+1..=N` are Byzantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u32);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl ReplicaId {
    /// Range `1..=n` inclusive, in ascending order.
    pub fn range(n: u32) -> impl Iterator<Item = ReplicaId> {
        (1..=n).map(ReplicaId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Per-dispatch handle a replica uses to emit sends, register timers, read
/// the clock, and log. Collected by the kernel after `on_message`/`on_timer`
/// returns.
pub struct ReplicaIo<M, T> {
    id: ReplicaId,
    clock: SimTime,
    pub(crate) outbox: Vec<Packet<M>>,
    pub(crate) timers: Vec<(T, SimTime)>,
}

impl<M, T> ReplicaIo<M, T> {
    pub(crate) fn new(id: ReplicaId, clock: SimTime) -> Self {
        Self {
            id,
            clock,
            outbox: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Enqueues an outgoing packet for this tick. Does not block and is not
    /// delivered until the current dispatch returns and the transport
    /// processes the batch.
    pub fn send(&mut self, dst: Destination, content: M) {
        self.outbox.push(Packet {
            src: self.id,
            dst,
            content,
            extra_delay: SimTime::ZERO,
        });
    }

    /// Convenience for `send(Destination::Broadcast, content)`.
    pub fn broadcast(&mut self, content: M) {
        self.send(Destination::Broadcast, content);
    }

    /// Schedules a self-timer to fire `delay` after the current clock.
    /// `delay` must be strictly positive.
    pub fn register_timer(&mut self, meta: T, delay: SimTime) {
        self.timers.push((meta, delay));
    }

    pub fn clock(&self) -> SimTime {
        self.clock
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn log(&self, level: LogLevel, payload: impl fmt::Display) {
        match level {
            LogLevel::Trace => tracing::trace!(replica = %self.id, clock = %self.clock, "{payload}"),
            LogLevel::Debug => tracing::debug!(replica = %self.id, clock = %self.clock, "{payload}"),
            LogLevel::Info => tracing::info!(replica = %self.id, clock = %self.clock, "{payload}"),
            LogLevel::Warn => tracing::warn!(replica = %self.id, clock = %self.clock, "{payload}"),
            LogLevel::Error => tracing::error!(replica = %self.id, clock = %self.clock, "{payload}"),
        }
    }
}

/// Parameters passed to a replica at construction.
#[derive(Clone)]
pub struct ReplicaInit<C> {
    pub id: ReplicaId,
    pub node_num: usize,
    pub byzantine_node_num: usize,
    pub seed: u64,
    pub config: C,
}

impl<C> ReplicaInit<C> {
    /// `f = floor((N-1)/3)`, the conventional Byzantine tolerance for this run.
    pub fn f(&self) -> usize {
        (self.node_num.saturating_sub(1)) / 3
    }
}

/// The contract every consensus protocol module implements.
pub trait Replica: Sized {
    /// Wire message type this protocol exchanges. Must be `Clone` because the
    /// attacker may duplicate packets, and serializable so results/logs can
    /// be persisted.
    type Message: Clone + fmt::Debug;
    /// Tag identifying one of this replica's own timer kinds: a variant enum,
    /// not a string name compared at dispatch time.
    type TimerMeta: Clone + fmt::Debug;
    /// Protocol-specific subtable of the configuration.
    type Config: Clone;

    /// Constructs a fresh replica and runs its bootstrap (may enqueue initial
    /// sends/timers through `io`).
    fn new(init: ReplicaInit<Self::Config>, io: &mut ReplicaIo<Self::Message, Self::TimerMeta>) -> Self;

    /// Called once per delivered packet addressed to this replica.
    fn on_message(
        &mut self,
        from: ReplicaId,
        message: Self::Message,
        io: &mut ReplicaIo<Self::Message, Self::TimerMeta>,
    );

    /// Called when a timer this replica registered fires.
    fn on_timer(&mut self, meta: Self::TimerMeta, io: &mut ReplicaIo<Self::Message, Self::TimerMeta>);

    /// Whether this replica has reached its first decision in the current run.
    fn is_decided(&self) -> bool;

    /// Returns this replica to a well-defined initial state between runs.
    /// The default re-constructs via `new`, which is correct for any
    /// protocol whose state doesn't depend on more than `ReplicaInit`.
    fn reset(&mut self, init: ReplicaInit<Self::Config>, io: &mut ReplicaIo<Self::Message, Self::TimerMeta>) {
        *self = Self::new(init, io);
    }
}
