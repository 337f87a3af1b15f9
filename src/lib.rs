//! `chronobft`: a discrete-event simulator for Byzantine-fault-tolerant
//! consensus protocols under adversarial network conditions.
//!
//! The crate is a small kernel: an event scheduler ([`scheduler`]), a virtual
//! network and delay model ([`transport`]), adversary interposition
//! ([`attacker`]), and the replica runtime contract ([`replica`]), all driven
//! by a [`run::RunController`] over one reference protocol
//! ([`protocols::babble`], a Hashgraph-style DAG consensus). Other protocols
//! plug in by implementing [`replica::Replica`]; other adversaries by
//! implementing [`attacker::Attacker`].
//!
//! See `README.md` for how to run a scenario.

pub mod attacker;
pub mod config;
pub mod error;
pub mod protocols;
pub mod replica;
pub mod rng;
pub mod run;
pub mod scheduler;
pub mod time;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
