//! Push-style ingestion: a bounded queue that is fair across owner keys.

mod keyed;
mod policy;

pub use keyed::KeyedQueue;
pub use policy::{HighestPriorityFirst, KeyProvider, OldestFirst, OwnerKeyProvider, Prioritiser};
