//! Durable storage for small Raft state records: the current term, the vote
//! in the current term, and the cluster membership. Each record type has its
//! own `StateStorage`, which persists the latest value and returns it on
//! startup.

mod file;
mod memory;

pub use file::File;
pub use memory::Memory;

use crate::error::Result;

/// Stores a single state record of type T.
pub trait StateStorage<T>: Send {
    /// Returns the last persisted state, or the initial state if none has been
    /// persisted yet.
    fn initial_state(&mut self) -> Result<T>;

    /// Durably persists the state. It must be durable when this returns.
    fn persist(&mut self, state: &T) -> Result<()>;
}
