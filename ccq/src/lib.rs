//! Cross chain query handling for a guardian node.
//!
//! Signed query requests arrive from the P2P layer, are checked by the [admission::AdmissionValidator] and split into
//! per-chain legs by the [handler::QueryHandler], which sends each leg to the watcher for its chain. Once every leg
//! has been answered, the combined response is handed to the [publisher::PublicationRetrier] for broadcast.

pub mod admission;
pub mod cfg;
pub mod chain;
pub mod crypto;
pub mod error;
pub mod handler;
pub mod launcher;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod timers;
pub mod watcher;
