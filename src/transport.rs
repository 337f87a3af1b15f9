//! Virtual network / transport and delay model.
//!
//! The transport is the only component that turns a `Packet` into a
//! scheduled delivery. It owns in-flight packets only for the duration of
//! one call to [`Transport::process_batch`]; once it hands a
//! `(SimTime, Packet)` pair back to the caller, ownership passes to the
//! scheduler.

use crate::attacker::{Attacker, AttackerIo};
use crate::replica::ReplicaId;
use crate::rng::SimRng;
use crate::time::SimTime;

/// Destination of an outgoing packet. `Broadcast` is expanded by the
/// transport into one concrete `Replica` packet per other replica before the
/// attacker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Replica(ReplicaId),
    Broadcast,
}

/// A single message in flight.
#[derive(Debug, Clone)]
pub struct Packet<M> {
    pub src: ReplicaId,
    pub dst: Destination,
    pub content: M,
    /// Non-negative delay the attacker has attached on top of the sampled
    /// network delay.
    pub extra_delay: SimTime,
}

/// Normal-distribution delay parameters, clamped to `>= 0`.
#[derive(Debug, Clone, Copy)]
pub struct DelayModel {
    pub mean: f64,
    pub std: f64,
}

impl DelayModel {
    pub fn sample(&self, rng: &mut SimRng) -> SimTime {
        let seconds = rng.sample_normal(self.mean, self.std).max(0.0);
        SimTime::from_secs_f64(seconds)
    }
}

/// Converts outgoing packets into scheduled deliveries, running them through
/// the mandatory attacker interposition layer first.
pub struct Transport<M> {
    node_num: u32,
    delay: DelayModel,
    dropped_packets: u64,
    delivered_packets: u64,
    _marker: std::marker::PhantomData<M>,
}

impl<M: Clone> Transport<M> {
    pub fn new(node_num: u32, delay: DelayModel) -> Self {
        Self {
            node_num,
            delay,
            dropped_packets: 0,
            delivered_packets: 0,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    pub fn delivered_packets(&self) -> u64 {
        self.delivered_packets
    }

    fn is_valid_id(&self, id: ReplicaId) -> bool {
        id.0 >= 1 && id.0 <= self.node_num
    }

    /// Expands every `Broadcast` destination into one `Replica` packet per
    /// other live id. Packets already addressed to a concrete replica pass
    /// through unchanged.
    fn expand(&self, packets: Vec<Packet<M>>) -> Vec<Packet<M>> {
        let mut out = Vec::with_capacity(packets.len());
        for packet in packets {
            match packet.dst {
                Destination::Replica(_) => out.push(packet),
                Destination::Broadcast => {
                    for id in ReplicaId::range(self.node_num) {
                        if id != packet.src {
                            out.push(Packet {
                                src: packet.src,
                                dst: Destination::Replica(id),
                                content: packet.content.clone(),
                                extra_delay: packet.extra_delay,
                            });
                        }
                    }
                }
            }
        }
        out
    }

    /// Runs one tick's worth of outgoing packets through expansion, then the
    /// attacker, then delay sampling. Returns each surviving packet paired
    /// with its absolute delivery time, ready for the caller to schedule.
    pub fn process_batch<A: Attacker<M>>(
        &mut self,
        batch: Vec<Packet<M>>,
        attacker: &mut A,
        attacker_io: &mut AttackerIo<A::TimerMeta>,
        rng: &mut SimRng,
        now: SimTime,
    ) -> Vec<(SimTime, Packet<M>)> {
        let expanded = self.expand(batch);
        let attacked = attacker.attack(expanded, attacker_io, rng);
        // The attacker may have injected a fresh Broadcast packet; expand once more.
        let attacked = self.expand(attacked);

        let mut scheduled = Vec::with_capacity(attacked.len());
        for packet in attacked {
            let Destination::Replica(dst) = packet.dst else {
                unreachable!("expand() leaves no Broadcast destinations");
            };
            if !self.is_valid_id(packet.src) || !self.is_valid_id(dst) {
                self.dropped_packets += 1;
                tracing::warn!(src = ?packet.src, dst = ?dst, "dropping malformed packet");
                continue;
            }
            let delivery_time = now.checked_add(self.delay.sample(rng)).checked_add(packet.extra_delay);
            self.delivered_packets += 1;
            scheduled.push((delivery_time, packet));
        }
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attacker::IdentityAttacker;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg(u32);

    #[test]
    fn broadcast_expands_to_n_minus_one_packets() {
        let mut transport = Transport::<Msg>::new(4, DelayModel { mean: 0.0, std: 0.0 });
        let mut attacker = IdentityAttacker::default();
        let mut io = AttackerIo::new(SimTime::ZERO);
        let mut rng = SimRng::from_seed(1);

        let batch = vec![Packet {
            src: ReplicaId(1),
            dst: Destination::Broadcast,
            content: Msg(7),
            extra_delay: SimTime::ZERO,
        }];
        let scheduled = transport.process_batch(batch, &mut attacker, &mut io, &mut rng, SimTime::ZERO);
        assert_eq!(scheduled.len(), 3);
        assert_eq!(transport.delivered_packets(), 3);
    }

    #[test]
    fn malformed_destination_is_dropped_not_delivered() {
        let mut transport = Transport::<Msg>::new(4, DelayModel { mean: 0.0, std: 0.0 });
        let mut attacker = IdentityAttacker::default();
        let mut io = AttackerIo::new(SimTime::ZERO);
        let mut rng = SimRng::from_seed(1);

        let batch = vec![Packet {
            src: ReplicaId(1),
            dst: Destination::Replica(ReplicaId(99)),
            content: Msg(1),
            extra_delay: SimTime::ZERO,
        }];
        let scheduled = transport.process_batch(batch, &mut attacker, &mut io, &mut rng, SimTime::ZERO);
        assert!(scheduled.is_empty());
        assert_eq!(transport.dropped_packets(), 1);
        assert_eq!(transport.delivered_packets(), 0);
    }

    #[test]
    fn delivery_time_never_precedes_send_time_plus_delay() {
        let mut transport = Transport::<Msg>::new(2, DelayModel { mean: 1.0, std: 0.0 });
        let mut attacker = IdentityAttacker::default();
        let mut io = AttackerIo::new(SimTime::ZERO);
        let mut rng = SimRng::from_seed(42);

        let now = SimTime::from_secs_f64(10.0);
        let batch = vec![Packet {
            src: ReplicaId(1),
            dst: Destination::Replica(ReplicaId(2)),
            content: Msg(0),
            extra_delay: SimTime::ZERO,
        }];
        let scheduled = transport.process_batch(batch, &mut attacker, &mut io, &mut rng, now);
        let (time, _) = &scheduled[0];
        assert!(*time >= now.checked_add(SimTime::from_secs_f64(1.0)));
    }
}
