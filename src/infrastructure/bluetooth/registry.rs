//! Bounded table of active connections
//!
//! Entries stay packed at the front of the table; removing one shifts every
//! later entry down by one slot.

use crate::domain::models::{AddressType, BdAddr};
use crate::domain::settings::MAX_NUM_TAGS;
use crate::infrastructure::bluetooth::connection::Connection;
use crate::infrastructure::bluetooth::protocol::ConnectionHandle;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("connection table full ({0} entries)")]
    Full(usize),
    #[error("connection {0} not found")]
    NotFound(ConnectionHandle),
    #[error("connection {0} already registered")]
    Duplicate(ConnectionHandle),
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Vec<Connection>,
    capacity: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_NUM_TAGS)
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(
        &mut self,
        handle: ConnectionHandle,
        address: BdAddr,
        address_type: AddressType,
        opened_at: Instant,
    ) -> Result<&mut Connection, RegistryError> {
        if self.by_handle(handle).is_some() {
            return Err(RegistryError::Duplicate(handle));
        }
        if self.is_full() {
            return Err(RegistryError::Full(self.capacity));
        }

        let slot = self.connections.len();
        self.connections
            .push(Connection::new(handle, address, address_type, opened_at));
        debug!("Connection {} stored in slot {}", handle, slot);
        Ok(&mut self.connections[slot])
    }

    /// Tear down a connection and its locator sessions
    pub fn remove(&mut self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let slot = self
            .connections
            .iter()
            .position(|c| c.handle() == handle)
            .ok_or(RegistryError::NotFound(handle))?;

        let connection = self.connections.remove(slot);
        info!(
            "Connection {} to {} removed, {} locator sessions dropped",
            handle,
            connection.tag_id(),
            connection.session_count()
        );
        Ok(())
    }

    pub fn by_handle(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.iter().find(|c| c.handle() == handle)
    }

    pub fn by_handle_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.handle() == handle)
    }

    pub fn by_address(&self, address: &BdAddr) -> Option<&Connection> {
        self.connections.iter().find(|c| &c.address() == address)
    }

    /// Handle stored in `slot`, [`ConnectionHandle::INVALID`] for unused slots
    pub fn handle_at(&self, slot: usize) -> ConnectionHandle {
        self.connections
            .get(slot)
            .map(|c| c.handle())
            .unwrap_or(ConnectionHandle::INVALID)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }
}
