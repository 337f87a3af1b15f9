//! Event queue and virtual clock.
//!
//! The scheduler owns exactly three things: the pending-event heap, the
//! current virtual clock, and a monotonic insertion sequence used to break
//! ties between events scheduled for the same instant, so that two events
//! landing on the same tick always run in the order they were submitted. It
//! does not know about replicas, the transport, or the attacker. Dispatching
//! an event is the caller's job, supplied as a closure to [`EventQueue::run_until`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{Error, Result};
use crate::replica::ReplicaId;
use crate::time::SimTime;

/// One pending occurrence in the simulation.
#[derive(Debug, Clone)]
pub enum Event<M, RT, AT> {
    /// A packet arriving at its destination.
    Delivery { dst: ReplicaId, src: ReplicaId, content: M },
    /// A timer a replica registered on itself.
    ReplicaTimer { replica: ReplicaId, meta: RT },
    /// A timer the attacker registered on itself.
    AttackerTimer { meta: AT },
}

/// An event paired with its absolute fire time and insertion sequence,
/// ordered so the earliest time (and, among ties, the earliest insertion)
/// sorts as the *greatest* `Scheduled`. `BinaryHeap` is a max-heap, so
/// reversing `Ord` here turns it into the min-heap the scheduler needs.
struct Scheduled<M, RT, AT> {
    time: SimTime,
    seq: u64,
    event: Event<M, RT, AT>,
}

impl<M, RT, AT> PartialEq for Scheduled<M, RT, AT> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}
impl<M, RT, AT> Eq for Scheduled<M, RT, AT> {}

impl<M, RT, AT> PartialOrd for Scheduled<M, RT, AT> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M, RT, AT> Ord for Scheduled<M, RT, AT> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

/// Owns the pending-event heap and the virtual clock. Generic over the
/// protocol's message type `M`, its timer-tag type `RT`, and the attacker's
/// timer-tag type `AT`.
pub struct EventQueue<M, RT, AT> {
    heap: BinaryHeap<Scheduled<M, RT, AT>>,
    clock: SimTime,
    next_seq: u64,
}

impl<M, RT, AT> EventQueue<M, RT, AT> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), clock: SimTime::ZERO, next_seq: 0 }
    }

    pub fn current_clock(&self) -> SimTime {
        self.clock
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Schedules `event` to fire at `time`. Rejects times strictly before the
    /// current clock; a plug-in that tries this has a bug.
    pub fn schedule(&mut self, time: SimTime, event: Event<M, RT, AT>) -> Result<()> {
        if time < self.clock {
            return Err(Error::InvalidTime { attempted: time, current: self.clock });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { time, seq, event });
        Ok(())
    }

    /// Resets the queue to a fresh, empty state at `SimTime::ZERO`, for
    /// starting the next run in the same process.
    pub fn reset(&mut self) {
        self.heap.clear();
        self.clock = SimTime::ZERO;
        self.next_seq = 0;
    }

    /// Pops and dispatches events in `(time, seq)` order until either the
    /// heap drains or `stop` returns `true`. `dispatch` is handed the queue
    /// itself along with each event's fire time and payload; it enacts the
    /// event's effects (delivering to a replica, firing a timer) and may
    /// call `schedule` on the queue reference it's given to enqueue follow-on
    /// events before returning.
    pub fn run_until(
        &mut self,
        mut dispatch: impl FnMut(&mut Self, SimTime, Event<M, RT, AT>),
        mut stop: impl FnMut(&Self) -> bool,
    ) {
        while let Some(scheduled) = self.heap.pop() {
            self.clock = scheduled.time;
            dispatch(self, scheduled.time, scheduled.event);
            if stop(self) {
                break;
            }
        }
    }
}

impl<M, RT, AT> Default for EventQueue<M, RT, AT> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_dispatch_in_time_order_regardless_of_insertion_order() {
        let mut queue: EventQueue<u32, u32, u32> = EventQueue::new();
        queue.schedule(SimTime::from_secs_f64(2.0), Event::ReplicaTimer { replica: ReplicaId(1), meta: 2 }).unwrap();
        queue.schedule(SimTime::from_secs_f64(1.0), Event::ReplicaTimer { replica: ReplicaId(1), meta: 1 }).unwrap();
        queue.schedule(SimTime::from_secs_f64(3.0), Event::ReplicaTimer { replica: ReplicaId(1), meta: 3 }).unwrap();

        let mut order = Vec::new();
        queue.run_until(
            |_q, _t, ev| {
                if let Event::ReplicaTimer { meta, .. } = ev {
                    order.push(meta);
                }
            },
            |_q| false,
        );
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn ties_at_the_same_time_resolve_fifo_by_insertion() {
        let mut queue: EventQueue<u32, u32, u32> = EventQueue::new();
        let t = SimTime::from_secs_f64(5.0);
        queue.schedule(t, Event::ReplicaTimer { replica: ReplicaId(1), meta: 10 }).unwrap();
        queue.schedule(t, Event::ReplicaTimer { replica: ReplicaId(1), meta: 20 }).unwrap();
        queue.schedule(t, Event::ReplicaTimer { replica: ReplicaId(1), meta: 30 }).unwrap();

        let mut order = Vec::new();
        queue.run_until(
            |_q, _t, ev| {
                if let Event::ReplicaTimer { meta, .. } = ev {
                    order.push(meta);
                }
            },
            |_q| false,
        );
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[test]
    fn scheduling_before_the_current_clock_is_rejected() {
        let mut queue: EventQueue<u32, u32, u32> = EventQueue::new();
        queue.schedule(SimTime::from_secs_f64(5.0), Event::ReplicaTimer { replica: ReplicaId(1), meta: 1 }).unwrap();
        queue.run_until(|_q, _t, _ev| {}, |_q| true);
        assert_eq!(queue.current_clock(), SimTime::from_secs_f64(5.0));

        let err = queue.schedule(SimTime::from_secs_f64(1.0), Event::ReplicaTimer { replica: ReplicaId(1), meta: 2 });
        assert!(err.is_err());
    }
}
