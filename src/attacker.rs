//! Adversary interposition layer.
//!
//! Every batch of outgoing packets passes through exactly one [`Attacker`]
//! before the transport samples delays. An attacker may drop, duplicate,
//! reorder (by attaching `extra_delay`), rewrite, or redirect any packet; the
//! kernel does not enforce that an attacker leaves `src` truthful, so
//! src-spoofing is a deliberately permitted adversary capability.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::replica::{LogLevel, ReplicaId};
use crate::rng::SimRng;
use crate::time::SimTime;
use crate::transport::{Destination, Packet};

/// Per-dispatch handle given to an attacker, mirroring [`crate::replica::ReplicaIo`]
/// minus `send`: an attacker expresses packet rewrites through its `attack`
/// return value, not by queuing sends on the side.
pub struct AttackerIo<T> {
    clock: SimTime,
    pub(crate) timers: Vec<(T, SimTime)>,
}

impl<T> AttackerIo<T> {
    pub fn new(clock: SimTime) -> Self {
        Self { clock, timers: Vec::new() }
    }

    pub fn register_timer(&mut self, meta: T, delay: SimTime) {
        self.timers.push((meta, delay));
    }

    pub fn clock(&self) -> SimTime {
        self.clock
    }

    pub fn log(&self, level: LogLevel, payload: impl fmt::Display) {
        match level {
            LogLevel::Trace => tracing::trace!(clock = %self.clock, "{payload}"),
            LogLevel::Debug => tracing::debug!(clock = %self.clock, "{payload}"),
            LogLevel::Info => tracing::info!(clock = %self.clock, "{payload}"),
            LogLevel::Warn => tracing::warn!(clock = %self.clock, "{payload}"),
            LogLevel::Error => tracing::error!(clock = %self.clock, "{payload}"),
        }
    }
}

/// The contract every adversary module implements.
pub trait Attacker<M> {
    /// Tag identifying one of this attacker's own timer kinds.
    type TimerMeta: Clone + fmt::Debug;

    /// Called once per tick with every packet sent during that tick
    /// (already expanded from any `Broadcast` destinations). Returns the
    /// packets that should actually be scheduled for delivery.
    fn attack(
        &mut self,
        batch: Vec<Packet<M>>,
        io: &mut AttackerIo<Self::TimerMeta>,
        rng: &mut SimRng,
    ) -> Vec<Packet<M>>;

    /// Called when a timer this attacker registered fires. Most attackers
    /// never register timers and can rely on the default no-op.
    #[allow(unused_variables)]
    fn on_timer(&mut self, meta: Self::TimerMeta, io: &mut AttackerIo<Self::TimerMeta>) {}
}

/// Passes every packet through unchanged. The baseline for "no adversary"
/// runs.
#[derive(Debug, Default)]
pub struct IdentityAttacker;

impl<M> Attacker<M> for IdentityAttacker {
    type TimerMeta = ();

    fn attack(&mut self, batch: Vec<Packet<M>>, _io: &mut AttackerIo<()>, _rng: &mut SimRng) -> Vec<Packet<M>> {
        batch
    }
}

/// Silences a fixed set of replicas: every packet they send or receive is
/// dropped for the rest of the run.
#[derive(Debug)]
pub struct FailStopAttacker {
    silenced: HashSet<ReplicaId>,
}

impl FailStopAttacker {
    pub fn new(silenced: impl IntoIterator<Item = ReplicaId>) -> Self {
        Self { silenced: silenced.into_iter().collect() }
    }
}

impl<M> Attacker<M> for FailStopAttacker {
    type TimerMeta = ();

    fn attack(&mut self, batch: Vec<Packet<M>>, _io: &mut AttackerIo<()>, _rng: &mut SimRng) -> Vec<Packet<M>> {
        batch
            .into_iter()
            .filter(|p| {
                let dst_silenced = matches!(p.dst, Destination::Replica(id) if self.silenced.contains(&id));
                !self.silenced.contains(&p.src) && !dst_silenced
            })
            .collect()
    }
}

/// Splits the replica set into disjoint groups; packets crossing a group
/// boundary are dropped until the partition heals at a fixed virtual time.
/// The heal timer is registered lazily on the first `attack` call, since an
/// attacker has no separate bootstrap entrypoint.
pub struct PartitionAttacker {
    group_of: HashMap<ReplicaId, usize>,
    heal_after: SimTime,
    healed: bool,
    heal_timer_armed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionHealTimer;

impl fmt::Debug for PartitionAttacker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionAttacker").field("healed", &self.healed).finish()
    }
}

impl PartitionAttacker {
    pub fn new(groups: Vec<Vec<ReplicaId>>, heal_after: SimTime) -> Self {
        let mut group_of = HashMap::new();
        for (group_idx, group) in groups.into_iter().enumerate() {
            for id in group {
                group_of.insert(id, group_idx);
            }
        }
        Self { group_of, heal_after, healed: false, heal_timer_armed: false }
    }

    fn crosses_partition(&self, src: ReplicaId, dst: ReplicaId) -> bool {
        match (self.group_of.get(&src), self.group_of.get(&dst)) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

impl<M> Attacker<M> for PartitionAttacker {
    type TimerMeta = PartitionHealTimer;

    fn attack(
        &mut self,
        batch: Vec<Packet<M>>,
        io: &mut AttackerIo<PartitionHealTimer>,
        _rng: &mut SimRng,
    ) -> Vec<Packet<M>> {
        if !self.heal_timer_armed {
            io.register_timer(PartitionHealTimer, self.heal_after);
            self.heal_timer_armed = true;
        }
        if self.healed {
            return batch;
        }
        batch
            .into_iter()
            .filter(|p| match p.dst {
                Destination::Replica(dst) => !self.crosses_partition(p.src, dst),
                Destination::Broadcast => true,
            })
            .collect()
    }

    fn on_timer(&mut self, _meta: PartitionHealTimer, _io: &mut AttackerIo<PartitionHealTimer>) {
        self.healed = true;
    }
}

/// For a configured set of Byzantine replicas, occasionally clones an
/// outgoing packet and mutates the clone, delivering both the original and
/// the mutated copy. Content mutation is protocol specific, so the mutation
/// function is supplied by the caller rather than guessed by the kernel.
pub struct EquivocationAttacker<M> {
    accomplices: HashSet<ReplicaId>,
    probability: f64,
    mutate: Box<dyn Fn(&M) -> M + Send>,
}

impl<M> fmt::Debug for EquivocationAttacker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EquivocationAttacker")
            .field("accomplices", &self.accomplices)
            .field("probability", &self.probability)
            .finish()
    }
}

impl<M> EquivocationAttacker<M> {
    pub fn new(
        accomplices: impl IntoIterator<Item = ReplicaId>,
        probability: f64,
        mutate: impl Fn(&M) -> M + Send + 'static,
    ) -> Self {
        Self {
            accomplices: accomplices.into_iter().collect(),
            probability: probability.clamp(0.0, 1.0),
            mutate: Box::new(mutate),
        }
    }
}

impl<M: Clone> Attacker<M> for EquivocationAttacker<M> {
    type TimerMeta = ();

    fn attack(&mut self, batch: Vec<Packet<M>>, _io: &mut AttackerIo<()>, rng: &mut SimRng) -> Vec<Packet<M>> {
        let mut out = Vec::with_capacity(batch.len());
        for packet in batch {
            let is_accomplice = self.accomplices.contains(&packet.src);
            if is_accomplice && rng.sample_bernoulli(self.probability) {
                let forged = Packet { content: (self.mutate)(&packet.content), ..packet.clone() };
                out.push(packet);
                out.push(forged);
            } else {
                out.push(packet);
            }
        }
        out
    }
}

/// Attaches a fixed extra delay to every packet addressed to a configured
/// target, sampled once per target at construction and held fixed for the
/// run.
#[derive(Debug)]
pub struct ClockSkewAttacker {
    skew: HashMap<ReplicaId, SimTime>,
}

impl ClockSkewAttacker {
    pub fn new(targets: impl IntoIterator<Item = ReplicaId>, min_skew: f64, max_skew: f64, rng: &mut SimRng) -> Self {
        let skew = targets
            .into_iter()
            .map(|id| (id, SimTime::from_secs_f64(rng.sample_uniform(min_skew, max_skew))))
            .collect();
        Self { skew }
    }
}

impl<M> Attacker<M> for ClockSkewAttacker {
    type TimerMeta = ();

    fn attack(&mut self, batch: Vec<Packet<M>>, _io: &mut AttackerIo<()>, _rng: &mut SimRng) -> Vec<Packet<M>> {
        batch
            .into_iter()
            .map(|mut p| {
                if let Destination::Replica(dst) = p.dst {
                    if let Some(extra) = self.skew.get(&dst) {
                        p.extra_delay = p.extra_delay.checked_add(*extra);
                    }
                }
                p
            })
            .collect()
    }
}

/// Unified attacker value wrapping every built-in, so a batch run can select
/// an attacker by its config `attacker` tag without trait objects
/// (`Attacker::TimerMeta` makes the trait itself non-object-safe).
pub enum AnyAttacker<M> {
    Identity(IdentityAttacker),
    FailStop(FailStopAttacker),
    Partition(PartitionAttacker),
    Equivocation(EquivocationAttacker<M>),
    ClockSkew(ClockSkewAttacker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyAttackerTimer {
    None,
    PartitionHeal,
}

impl<M: Clone> Attacker<M> for AnyAttacker<M> {
    type TimerMeta = AnyAttackerTimer;

    fn attack(&mut self, batch: Vec<Packet<M>>, io: &mut AttackerIo<AnyAttackerTimer>, rng: &mut SimRng) -> Vec<Packet<M>> {
        match self {
            AnyAttacker::Identity(a) => {
                let mut inner = AttackerIo::new(io.clock());
                a.attack(batch, &mut inner, rng)
            }
            AnyAttacker::FailStop(a) => {
                let mut inner = AttackerIo::new(io.clock());
                a.attack(batch, &mut inner, rng)
            }
            AnyAttacker::Partition(a) => {
                let mut inner = AttackerIo::new(io.clock());
                let out = a.attack(batch, &mut inner, rng);
                for (_, delay) in inner.timers {
                    io.register_timer(AnyAttackerTimer::PartitionHeal, delay);
                }
                out
            }
            AnyAttacker::Equivocation(a) => {
                let mut inner = AttackerIo::new(io.clock());
                a.attack(batch, &mut inner, rng)
            }
            AnyAttacker::ClockSkew(a) => {
                let mut inner = AttackerIo::new(io.clock());
                a.attack(batch, &mut inner, rng)
            }
        }
    }

    fn on_timer(&mut self, meta: AnyAttackerTimer, io: &mut AttackerIo<AnyAttackerTimer>) {
        if let (AnyAttacker::Partition(a), AnyAttackerTimer::PartitionHeal) = (&mut *self, meta) {
            let mut inner = AttackerIo::new(io.clock());
            a.on_timer(PartitionHealTimer, &mut inner);
        }
    }
}

fn toml_number(table: &toml::value::Table, key: &str, default: f64) -> crate::error::Result<f64> {
    match table.get(key) {
        None => Ok(default),
        Some(v) => v.as_float().or_else(|| v.as_integer().map(|i| i as f64)).ok_or_else(|| crate::error::Error::InvalidConfig {
            field: format!("attacker.{key}"),
            reason: "expected a number".into(),
        }),
    }
}

fn partition_groups_from_table(table: &toml::value::Table) -> crate::error::Result<Vec<Vec<ReplicaId>>> {
    let bad_groups = || crate::error::Error::InvalidConfig {
        field: "attacker.groups".into(),
        reason: "expected an array of arrays of non-negative replica ids".into(),
    };
    let groups = table.get("groups").and_then(|v| v.as_array()).ok_or_else(bad_groups)?;
    groups
        .iter()
        .map(|group| {
            group
                .as_array()
                .ok_or_else(bad_groups)?
                .iter()
                .map(|id| id.as_integer().and_then(|i| u32::try_from(i).ok()).map(ReplicaId).ok_or_else(bad_groups))
                .collect::<crate::error::Result<Vec<ReplicaId>>>()
        })
        .collect()
}

/// Constructs the attacker named by the `attacker` config tag. `mutate` is
/// protocol-specific and supplied by the caller, since the kernel cannot
/// introspect a generic message type.
pub fn from_config<M: Clone + 'static>(
    tag: &str,
    table: &toml::value::Table,
    node_num: u32,
    byzantine_node_num: u32,
    rng: &mut SimRng,
    mutate: impl Fn(&M) -> M + Send + 'static,
) -> crate::error::Result<AnyAttacker<M>> {
    use crate::error::Error;
    let byzantine_ids = || ((node_num - byzantine_node_num + 1)..=node_num).map(ReplicaId);
    match tag {
        "identity" => Ok(AnyAttacker::Identity(IdentityAttacker)),
        "fail-stop" => Ok(AnyAttacker::FailStop(FailStopAttacker::new(byzantine_ids()))),
        "partition" => {
            let groups = partition_groups_from_table(table)?;
            let heal_after = SimTime::from_secs_f64(toml_number(table, "heal_after_secs", 60.0)?);
            Ok(AnyAttacker::Partition(PartitionAttacker::new(groups, heal_after)))
        }
        "equivocation" => {
            let probability = toml_number(table, "probability", 0.3)?;
            Ok(AnyAttacker::Equivocation(EquivocationAttacker::new(byzantine_ids(), probability, mutate)))
        }
        "clock-skew" => {
            let min_skew = toml_number(table, "min_skew_secs", 0.0)?;
            let max_skew = toml_number(table, "max_skew_secs", 5.0)?;
            Ok(AnyAttacker::ClockSkew(ClockSkewAttacker::new(byzantine_ids(), min_skew, max_skew, rng)))
        }
        other => Err(Error::InvalidConfig { field: "attacker".into(), reason: format!("unknown tag `{other}`") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg(u32);

    fn packet(src: u32, dst: u32) -> Packet<Msg> {
        Packet { src: ReplicaId(src), dst: Destination::Replica(ReplicaId(dst)), content: Msg(0), extra_delay: SimTime::ZERO }
    }

    #[test]
    fn fail_stop_drops_all_traffic_touching_silenced_replica() {
        let mut attacker = FailStopAttacker::new([ReplicaId(3)]);
        let mut io = AttackerIo::new(SimTime::ZERO);
        let mut rng = SimRng::from_seed(1);
        let batch = vec![packet(1, 2), packet(1, 3), packet(3, 1)];
        let out: Vec<_> = attacker.attack(batch, &mut io, &mut rng);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dst, Destination::Replica(ReplicaId(2)));
    }

    #[test]
    fn partition_drops_cross_group_traffic_until_healed() {
        let mut attacker = PartitionAttacker::new(vec![vec![ReplicaId(1)], vec![ReplicaId(2)]], SimTime::from_secs_f64(10.0));
        let mut io = AttackerIo::new(SimTime::ZERO);
        let mut rng = SimRng::from_seed(1);
        let out = attacker.attack(vec![packet(1, 2)], &mut io, &mut rng);
        assert!(out.is_empty());
        assert_eq!(io.timers.len(), 1);

        attacker.on_timer(PartitionHealTimer, &mut io);
        let out = attacker.attack(vec![packet(1, 2)], &mut io, &mut rng);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn clock_skew_adds_fixed_extra_delay_per_target() {
        let mut rng = SimRng::from_seed(9);
        let mut attacker = ClockSkewAttacker::new([ReplicaId(2)], 1.0, 1.0, &mut rng);
        let mut io = AttackerIo::new(SimTime::ZERO);
        let out = attacker.attack(vec![packet(1, 2)], &mut io, &mut rng);
        assert_eq!(out[0].extra_delay, SimTime::from_secs_f64(1.0));
    }
}
