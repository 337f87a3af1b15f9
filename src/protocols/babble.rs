//! Hashgraph-style DAG consensus, the reference protocol.
//!
//! Each replica keeps a local event graph (creator → chain of events linked
//! by `self_parent`, cross-linked to other creators by `other_parent`),
//! periodically creates events and gossips with peers, and promotes
//! sufficiently old events to consensus, grouping them into blocks that are
//! finalized once `2f+1` signatures are observed. This is a deliberately
//! simplified consensus rule (an event two rounds old is consensus, full
//! stop), not a full virtual-voting/famousness implementation: it keeps the
//! observable round/witness/block bookkeeping a real Hashgraph deployment
//! relies on without the fame-voting machinery those protocols add on top.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::replica::{LogLevel, Replica, ReplicaId, ReplicaInit, ReplicaIo};
use crate::time::SimTime;
use crate::transport::Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventHash(pub [u8; 32]);

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Opaque signature token; no real cryptography backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BabbleEvent {
    pub creator: ReplicaId,
    pub self_parent: Option<EventHash>,
    pub other_parent: Option<EventHash>,
    pub timestamp: SimTime,
    pub transactions: Vec<Transaction>,
    pub signature: Signature,
    pub round: i64,
    pub consensus_flag: bool,
    pub witness_flag: bool,
    pub hash: EventHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub events: Vec<EventHash>,
    pub round: i64,
    pub index: u64,
    pub hash: BlockHash,
    pub transactions: Vec<Transaction>,
    pub finalized: bool,
}

/// Wire messages this protocol exchanges. A plain tagged enum, with an
/// explicit `Malformed` variant so an attacker that mangles a packet's bytes
/// still produces a value this protocol's `on_message` can handle rather than
/// a deserialization panic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BabbleMessage {
    SyncRequest { known_tips: HashMap<ReplicaId, Option<EventHash>> },
    SyncResponse { events: Vec<BabbleEvent> },
    BlockAnnounce { block: Block },
    BlockSignature { block_hash: BlockHash },
    Malformed(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BabbleTimer {
    Heartbeat,
    SyncTick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BabbleState {
    Running,
    Suspended,
    Decided,
}

/// Protocol-specific subtable, the `babble.*` keys of a scenario file.
#[derive(Debug, Clone)]
pub struct BabbleConfig {
    /// Fraction of `N`; suspend once undecided events exceed `suspend_limit * N`.
    pub suspend_limit: f64,
    pub sync_interval_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub sync_response_limit: usize,
    /// `is_decided()` fires once this many blocks have been produced.
    /// Exposed as a config knob rather than hardcoded so a deployment can
    /// tune the decision latency without touching this module.
    pub decision_block_threshold: u64,
    /// `"ssb"` or `"libp2p"`; recorded only, doesn't change behavior. Both
    /// name a real gossip transport Babble can run over; this kernel's
    /// virtual network stands in for whichever one is named.
    pub sync_transport: String,
}

impl BabbleConfig {
    pub fn from_table(table: &toml::value::Table, default_heartbeat_secs: f64) -> Result<Self> {
        Ok(Self {
            suspend_limit: toml_f64(table, "suspend_limit", 1.0)?,
            sync_interval_secs: toml_f64(table, "sync_interval", 1.0)?,
            heartbeat_interval_secs: toml_f64(table, "heartbeat_interval", default_heartbeat_secs)?,
            sync_response_limit: toml_usize(table, "sync_response_limit", 64)?,
            decision_block_threshold: toml_u64(table, "decision_block_threshold", 3)?,
            sync_transport: toml_string(table, "sync_transport", "ssb")?,
        })
    }
}

fn toml_f64(table: &toml::value::Table, key: &str, default: f64) -> Result<f64> {
    match table.get(key) {
        None => Ok(default),
        Some(v) => v.as_float().or_else(|| v.as_integer().map(|i| i as f64)).ok_or_else(|| Error::InvalidConfig {
            field: format!("babble.{key}"),
            reason: "expected a number".into(),
        }),
    }
}

fn toml_usize(table: &toml::value::Table, key: &str, default: usize) -> Result<usize> {
    match table.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| Error::InvalidConfig { field: format!("babble.{key}"), reason: "expected a non-negative integer".into() }),
    }
}

fn toml_u64(table: &toml::value::Table, key: &str, default: u64) -> Result<u64> {
    match table.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| Error::InvalidConfig { field: format!("babble.{key}"), reason: "expected a non-negative integer".into() }),
    }
}

fn toml_string(table: &toml::value::Table, key: &str, default: &str) -> Result<String> {
    match table.get(key) {
        None => Ok(default.to_string()),
        Some(v) => v.as_str().map(str::to_string).ok_or_else(|| Error::InvalidConfig {
            field: format!("babble.{key}"),
            reason: "expected a string".into(),
        }),
    }
}

fn event_hash(
    creator: ReplicaId,
    self_parent: Option<EventHash>,
    other_parent: Option<EventHash>,
    timestamp: SimTime,
    transactions: &[Transaction],
) -> EventHash {
    #[derive(Serialize)]
    struct Preimage<'a> {
        creator: ReplicaId,
        self_parent: Option<EventHash>,
        other_parent: Option<EventHash>,
        timestamp: SimTime,
        transactions: &'a [Transaction],
    }
    let bytes = bincode::serialize(&Preimage { creator, self_parent, other_parent, timestamp, transactions })
        .expect("event preimage is always serializable");
    EventHash(*blake3::hash(&bytes).as_bytes())
}

fn sign(hash: EventHash, signer: ReplicaId) -> Signature {
    let bytes = bincode::serialize(&(hash, signer)).expect("signature preimage is always serializable");
    let digest = blake3::hash(&bytes);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    Signature(u64::from_le_bytes(buf))
}

fn block_hash(round: i64, index: u64, events: &[EventHash], transactions: &[Transaction]) -> BlockHash {
    #[derive(Serialize)]
    struct Preimage<'a> {
        round: i64,
        index: u64,
        events: &'a [EventHash],
        transactions: &'a [Transaction],
    }
    let bytes = bincode::serialize(&Preimage { round, index, events, transactions }).expect("block preimage is always serializable");
    BlockHash(*blake3::hash(&bytes).as_bytes())
}

pub struct BabbleReplica {
    id: ReplicaId,
    node_num: usize,
    f: usize,
    config: BabbleConfig,
    /// The local event graph: nodes are events, edges point from an event to
    /// its parents. Events reference parents by hash, so the graph is
    /// acyclic by construction.
    graph: StableDiGraph<BabbleEvent, ()>,
    /// Hash → node index, for O(1)-ish parent resolution and dedup.
    index: HashMap<EventHash, NodeIndex>,
    /// Per-creator pointer to the most recent event on its main chain as
    /// known to us. A fork is retained in the graph but does not move this
    /// pointer: forks are tolerated, not silently collapsed.
    heads: HashMap<ReplicaId, EventHash>,
    witnesses: HashMap<i64, Vec<EventHash>>,
    max_round: i64,
    next_round_to_decide: i64,
    blocks: Vec<Block>,
    pending_signatures: HashMap<BlockHash, HashSet<ReplicaId>>,
    last_synced: HashMap<ReplicaId, SimTime>,
    state: BabbleState,
}

type Io = ReplicaIo<BabbleMessage, BabbleTimer>;

impl BabbleReplica {
    fn event(&self, hash: EventHash) -> Option<&BabbleEvent> {
        self.index.get(&hash).map(|&idx| &self.graph[idx])
    }

    fn parent_round(&self, hash: Option<EventHash>) -> i64 {
        hash.and_then(|h| self.event(h)).map(|e| e.round).unwrap_or(-1)
    }

    /// Inserts `event` into the graph and wires edges to its parents.
    fn insert_into_graph(&mut self, event: BabbleEvent) {
        let hash = event.hash;
        let parents = [event.self_parent, event.other_parent];
        let node = self.graph.add_node(event);
        self.index.insert(hash, node);
        for parent in parents.into_iter().flatten() {
            if let Some(&parent_node) = self.index.get(&parent) {
                self.graph.add_edge(node, parent_node, ());
            }
        }
    }

    fn create_event(&mut self, learned_from: Option<ReplicaId>, io: &mut Io) {
        let self_parent = self.heads.get(&self.id).copied();
        let other_parent = learned_from.and_then(|peer| self.heads.get(&peer).copied());
        let timestamp = io.clock();
        let transactions: Vec<Transaction> = Vec::new();
        let hash = event_hash(self.id, self_parent, other_parent, timestamp, &transactions);
        let round = std::cmp::max(self.parent_round(self_parent), self.parent_round(other_parent)) + 1;
        let witness_flag = !self.graph.node_weights().any(|e| e.creator == self.id && e.round == round);
        let signature = sign(hash, self.id);

        let event = BabbleEvent { creator: self.id, self_parent, other_parent, timestamp, transactions, signature, round, consensus_flag: false, witness_flag, hash };
        if witness_flag {
            self.witnesses.entry(round).or_default().push(hash);
        }
        self.max_round = self.max_round.max(round);
        self.insert_into_graph(event);
        self.heads.insert(self.id, hash);

        self.advance_consensus(io);
    }

    fn try_insert_event(&mut self, event: BabbleEvent, io: &mut Io) {
        if self.index.contains_key(&event.hash) {
            return;
        }
        let expected_hash = event_hash(event.creator, event.self_parent, event.other_parent, event.timestamp, &event.transactions);
        if expected_hash != event.hash {
            io.log(LogLevel::Warn, format!("dropping event {} failing hash-integrity check", event.hash));
            return;
        }
        if let Some(p) = event.self_parent {
            if !self.index.contains_key(&p) {
                io.log(LogLevel::Warn, format!("dropping event {} with unknown self_parent", event.hash));
                return;
            }
        }
        if let Some(p) = event.other_parent {
            if !self.index.contains_key(&p) {
                io.log(LogLevel::Warn, format!("dropping event {} with unknown other_parent", event.hash));
                return;
            }
        }

        let round = std::cmp::max(self.parent_round(event.self_parent), self.parent_round(event.other_parent)) + 1;
        let witness_flag = !self.graph.node_weights().any(|e| e.creator == event.creator && e.round == round);
        let creator = event.creator;
        let hash = event.hash;
        let self_parent = event.self_parent;

        let event = BabbleEvent { round, witness_flag, consensus_flag: false, ..event };
        if witness_flag {
            self.witnesses.entry(round).or_default().push(hash);
        }
        self.max_round = self.max_round.max(round);

        let should_advance_head = match self.heads.get(&creator) {
            None => true,
            Some(current) => Some(*current) == self_parent,
        };
        self.insert_into_graph(event);
        if should_advance_head {
            self.heads.insert(creator, hash);
        }

        self.advance_consensus(io);
    }

    /// Promotes sufficiently old events to consensus and packages each fully
    /// settled round into a block.
    fn advance_consensus(&mut self, io: &mut Io) {
        let threshold = self.max_round - 2;
        while self.next_round_to_decide <= threshold {
            let round = self.next_round_to_decide;
            let mut group: Vec<EventHash> = self
                .graph
                .node_weights()
                .filter(|e| e.round == round && !e.consensus_flag)
                .map(|e| e.hash)
                .collect();
            group.sort();

            if group.is_empty() {
                self.next_round_to_decide += 1;
                continue;
            }

            for hash in &group {
                let node = self.index[hash];
                self.graph[node].consensus_flag = true;
            }

            let mut seen = HashSet::new();
            let mut transactions = Vec::new();
            for hash in &group {
                for tx in &self.event(*hash).expect("group hash came from self.index").transactions {
                    if seen.insert(tx.clone()) {
                        transactions.push(tx.clone());
                    }
                }
            }

            let index = self.blocks.len() as u64;
            let hash = block_hash(round, index, &group, &transactions);
            let block = Block { events: group, round, index, hash, transactions, finalized: false };
            self.blocks.push(block.clone());
            self.pending_signatures.entry(hash).or_default().insert(self.id);
            io.broadcast(BabbleMessage::BlockAnnounce { block });

            self.next_round_to_decide += 1;
        }

        let undecided = self.graph.node_weights().filter(|e| !e.consensus_flag).count();
        if self.state == BabbleState::Running && undecided as f64 > self.config.suspend_limit * self.node_num as f64 {
            self.state = BabbleState::Suspended;
            io.log(LogLevel::Warn, "suspending: undecided event backlog exceeds suspend_limit * N");
        }
        if self.state == BabbleState::Running && self.blocks.len() as u64 > self.config.decision_block_threshold {
            self.state = BabbleState::Decided;
        }
    }

    fn known_tips(&self) -> HashMap<ReplicaId, Option<EventHash>> {
        ReplicaId::range(self.node_num as u32).map(|id| (id, self.heads.get(&id).copied())).collect()
    }

    /// Ancestors of our heads the peer described by `known` is missing,
    /// ordered parents-before-children and capped at `sync_response_limit`.
    fn missing_for(&self, known: &HashMap<ReplicaId, Option<EventHash>>) -> Vec<EventHash> {
        let mut missing = Vec::new();
        for creator in ReplicaId::range(self.node_num as u32) {
            let stop_at = known.get(&creator).copied().flatten();
            let mut cursor = self.heads.get(&creator).copied();
            while let Some(hash) = cursor {
                if Some(hash) == stop_at {
                    break;
                }
                missing.push(hash);
                cursor = self.event(hash).and_then(|e| e.self_parent);
            }
        }
        missing.sort_by_key(|h| {
            let event = self.event(*h).expect("missing hashes always come from our own graph");
            (event.round, event.timestamp)
        });
        missing.truncate(self.config.sync_response_limit);
        missing
    }

    fn pick_sync_peer(&self) -> Option<ReplicaId> {
        ReplicaId::range(self.node_num as u32)
            .filter(|id| *id != self.id)
            .min_by_key(|id| (self.last_synced.get(id).copied().unwrap_or(SimTime::ZERO), id.0))
    }
}

/// Mutation function for an [`crate::attacker::EquivocationAttacker`] running
/// against this protocol: a forged copy is turned into an explicit
/// `Malformed` payload rather than a forged-but-plausible message, since
/// `BabbleMessage` has no generic "flip a byte" operation.
pub fn equivocation_mutation(message: &BabbleMessage) -> BabbleMessage {
    let bytes = bincode::serialize(message).unwrap_or_default();
    BabbleMessage::Malformed(bytes)
}

impl Replica for BabbleReplica {
    type Message = BabbleMessage;
    type TimerMeta = BabbleTimer;
    type Config = BabbleConfig;

    fn new(init: ReplicaInit<BabbleConfig>, io: &mut Io) -> Self {
        let mut replica = BabbleReplica {
            id: init.id,
            node_num: init.node_num,
            f: init.f(),
            config: init.config,
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            heads: HashMap::new(),
            witnesses: HashMap::new(),
            max_round: -1,
            next_round_to_decide: 0,
            blocks: Vec::new(),
            pending_signatures: HashMap::new(),
            last_synced: HashMap::new(),
            state: BabbleState::Running,
        };
        replica.create_event(None, io);
        io.register_timer(BabbleTimer::Heartbeat, SimTime::from_secs_f64(replica.config.heartbeat_interval_secs));
        if replica.node_num > 1 {
            io.register_timer(BabbleTimer::SyncTick, SimTime::from_secs_f64(replica.config.sync_interval_secs));
        }
        replica
    }

    fn on_message(&mut self, from: ReplicaId, message: BabbleMessage, io: &mut Io) {
        match message {
            BabbleMessage::SyncRequest { known_tips } => {
                let events = self
                    .missing_for(&known_tips)
                    .into_iter()
                    .map(|h| self.event(h).expect("missing_for only returns hashes we hold").clone())
                    .collect();
                io.send(Destination::Replica(from), BabbleMessage::SyncResponse { events });
            }
            BabbleMessage::SyncResponse { events } => {
                for event in events {
                    self.try_insert_event(event, io);
                }
                self.create_event(Some(from), io);
            }
            BabbleMessage::BlockAnnounce { block } => {
                let expected = block_hash(block.round, block.index, &block.events, &block.transactions);
                if expected != block.hash {
                    io.log(LogLevel::Warn, format!("dropping block {} failing hash-integrity check", block.hash));
                    return;
                }
                io.send(Destination::Replica(from), BabbleMessage::BlockSignature { block_hash: block.hash });
            }
            BabbleMessage::BlockSignature { block_hash } => {
                let sigs = self.pending_signatures.entry(block_hash).or_default();
                sigs.insert(from);
                sigs.insert(self.id);
                if sigs.len() >= 2 * self.f + 1 {
                    if let Some(block) = self.blocks.iter_mut().find(|b| b.hash == block_hash) {
                        block.finalized = true;
                    }
                }
            }
            BabbleMessage::Malformed(_) => {
                io.log(LogLevel::Warn, "dropping malformed message");
            }
        }
    }

    fn on_timer(&mut self, meta: BabbleTimer, io: &mut Io) {
        match meta {
            BabbleTimer::Heartbeat => {
                if self.state != BabbleState::Suspended {
                    self.create_event(None, io);
                }
                io.register_timer(BabbleTimer::Heartbeat, SimTime::from_secs_f64(self.config.heartbeat_interval_secs));
            }
            BabbleTimer::SyncTick => {
                if self.state != BabbleState::Suspended {
                    if let Some(peer) = self.pick_sync_peer() {
                        io.send(Destination::Replica(peer), BabbleMessage::SyncRequest { known_tips: self.known_tips() });
                        self.last_synced.insert(peer, io.clock());
                    }
                }
                io.register_timer(BabbleTimer::SyncTick, SimTime::from_secs_f64(self.config.sync_interval_secs));
            }
        }
    }

    fn is_decided(&self) -> bool {
        self.state == BabbleState::Decided
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BabbleConfig {
        BabbleConfig {
            suspend_limit: 1.0,
            sync_interval_secs: 1.0,
            heartbeat_interval_secs: 1.0,
            sync_response_limit: 64,
            decision_block_threshold: 3,
            sync_transport: "ssb".into(),
        }
    }

    #[test]
    fn genesis_event_has_round_zero_and_is_a_witness() {
        let mut io = ReplicaIo::new(ReplicaId(1), SimTime::ZERO);
        let replica = BabbleReplica::new(ReplicaInit { id: ReplicaId(1), node_num: 4, byzantine_node_num: 1, seed: 0, config: config() }, &mut io);
        let head = replica.heads[&ReplicaId(1)];
        let genesis = replica.event(head).unwrap();
        assert_eq!(genesis.round, 0);
        assert!(genesis.witness_flag);
    }

    #[test]
    fn tampered_event_content_fails_hash_integrity_and_is_dropped() {
        let mut io = ReplicaIo::new(ReplicaId(1), SimTime::ZERO);
        let mut replica =
            BabbleReplica::new(ReplicaInit { id: ReplicaId(1), node_num: 4, byzantine_node_num: 1, seed: 0, config: config() }, &mut io);
        let before = replica.graph.node_count();

        let mut forged = BabbleEvent {
            creator: ReplicaId(2),
            self_parent: None,
            other_parent: None,
            timestamp: SimTime::ZERO,
            transactions: vec![],
            signature: Signature(0),
            round: 0,
            consensus_flag: false,
            witness_flag: true,
            hash: EventHash([0u8; 32]),
        };
        forged.hash = event_hash(forged.creator, forged.self_parent, forged.other_parent, forged.timestamp, &forged.transactions);
        forged.transactions.push(Transaction(vec![1, 2, 3]));

        replica.try_insert_event(forged, &mut io);
        assert_eq!(replica.graph.node_count(), before);
    }

    #[test]
    fn sync_response_events_are_parent_before_child_ordered() {
        let mut io = ReplicaIo::new(ReplicaId(1), SimTime::ZERO);
        let replica = BabbleReplica::new(ReplicaInit { id: ReplicaId(1), node_num: 3, byzantine_node_num: 0, seed: 0, config: config() }, &mut io);
        let known = HashMap::new();
        let missing = replica.missing_for(&known);
        assert_eq!(missing.len(), 1);
    }
}
