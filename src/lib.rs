//! Durable per-queue message index.
//!
//! Records the ordered lifecycle of every message a queue handles
//! (publish, deliver, ack) in an append-only journal that is drained
//! into fixed-range segment files, and reconstructs the authoritative
//! set of unacknowledged messages after a crash. The message bodies
//! themselves live in an external message store unless small enough to
//! embed; at startup [`walker::start`] replays every durable queue to
//! seed that store's reference counts.

pub mod codec;
pub mod error;
pub mod index;
pub mod journal;
pub mod layout;
pub mod merge;
pub mod recovery_terms;
pub mod segment;
pub mod segment_store;
pub mod upgrade;
pub mod walker;

pub use codec::{
    next_segment_boundary, Message, MessageProps, MsgId, MsgRef, SeqId, SEGMENT_ENTRY_COUNT,
};
pub use error::{Error, Result};
pub use index::{
    scan_queue_segments, IndexConfig, IndexEntry, QueueIndex, SyncCallback, SyncNeed,
};
pub use recovery_terms::{QueueTerms, RecoveryTerms, RecoveryTermsStore};
pub use walker::Walker;
