use super::StateStorage;
use crate::error::Result;

use std::sync::{Arc, Mutex};

/// An in-memory state store. Nothing is persisted across process restarts,
/// but clones share the same state, so a "restarted" member can be created
/// from a clone. Used for tests and the demo cluster.
pub struct Memory<T> {
    state: Arc<Mutex<T>>,
}

impl<T> Clone for Memory<T> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<T: Clone> Memory<T> {
    /// Creates a new in-memory store with the given initial state.
    pub fn new(initial: T) -> Self {
        Self { state: Arc::new(Mutex::new(initial)) }
    }

    /// Returns the currently stored state.
    pub fn get(&self) -> Result<T> {
        Ok(self.state.lock()?.clone())
    }
}

impl<T: Clone + Default> Default for Memory<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + Send> StateStorage<T> for Memory<T> {
    fn initial_state(&mut self) -> Result<T> {
        self.get()
    }

    fn persist(&mut self, state: &T) -> Result<()> {
        *self.state.lock()? = state.clone();
        Ok(())
    }
}
