//! SocketRegistry — handle → connection table.
//!
//! The registry is the sole owner of every live connection. Everything else
//! refers to a connection by its `Handle` and looks it up for the duration
//! of one operation.
//!
//! Invariant: a handle is present iff a live connection owns it and has not
//! finished closing. `insert` refuses a second owner rather than replacing
//! the first.

use std::collections::HashMap;

use netlib_core::{Handle, NetError, Result};

pub struct SocketRegistry<C> {
    entries: HashMap<Handle, C>,
}

impl<C> Default for SocketRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SocketRegistry<C> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: HashMap::with_capacity(capacity) }
    }

    /// Register `conn` as the owner of `handle`.
    ///
    /// Returns `AlreadyExists` (and leaves the current owner in place) if the
    /// handle is taken.
    pub fn insert(&mut self, handle: Handle, conn: C) -> Result<()> {
        if self.entries.contains_key(&handle) {
            return Err(NetError::AlreadyExists(handle));
        }
        self.entries.insert(handle, conn);
        Ok(())
    }

    /// Remove and return the owner of `handle`. No-op if absent.
    pub fn remove(&mut self, handle: Handle) -> Option<C> {
        self.entries.remove(&handle)
    }

    pub fn lookup(&self, handle: Handle) -> Result<&C> {
        self.entries.get(&handle).ok_or(NetError::NotFound(handle))
    }

    pub fn lookup_mut(&mut self, handle: Handle) -> Result<&mut C> {
        self.entries.get_mut(&handle).ok_or(NetError::NotFound(handle))
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.keys().copied()
    }

    /// Empty the table, yielding every owner.
    pub fn drain(&mut self) -> impl Iterator<Item = (Handle, C)> + '_ {
        self.entries.drain()
    }
}
