//! Consensus protocol modules.
//!
//! `babble` is the only full implementation: a Hashgraph-style DAG consensus
//! protocol, chosen as the reference core because its gossip-then-vote shape
//! exercises every part of the [`crate::replica::Replica`] contract. The
//! remaining `protocol` config tags name real external consensus protocols
//! this crate does not reimplement; they resolve to
//! [`crate::error::Error::ProtocolNotImplemented`].

pub mod babble;
