//! Connection table
//!
//! Owns every live [`Connection`]. Lookup by 4-tuple serves inbound
//! segments; lookup by identity serves timers and the application. Identities
//! grow monotonically, so iterating `by_id` yields creation order.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::transport::connection::{Connection, ConnectionId, Quad};

#[derive(Debug)]
pub struct ConnectionTable {
    by_id: BTreeMap<ConnectionId, Connection>,
    by_quad: HashMap<Quad, ConnectionId>,
    next_id: u64,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_quad: HashMap::new(),
            next_id: 1,
            capacity,
        }
    }

    /// Reserve the identity for the next connection
    pub fn next_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn is_full(&self) -> bool {
        self.by_id.len() >= self.capacity
    }

    pub fn insert(&mut self, connection: Connection) -> Result<ConnectionId> {
        if self.is_full() {
            return Err(Error::ResourceExhausted);
        }
        let quad = connection.quad();
        if self.by_quad.contains_key(&quad) {
            return Err(Error::AddrInUse(quad.local.port()));
        }
        let id = connection.id();
        self.by_quad.insert(quad, id);
        self.by_id.insert(id, connection);
        Ok(id)
    }

    pub fn lookup(&self, quad: &Quad) -> Option<ConnectionId> {
        self.by_quad.get(quad).copied()
    }

    pub fn contains_quad(&self, quad: &Quad) -> bool {
        self.by_quad.contains_key(quad)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.by_id.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.by_id.remove(&id)?;
        self.by_quad.remove(&connection.quad());
        Some(connection)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
