use std::collections::HashMap;
use thiserror::Error as ThisError;

use crate::session::{ClientSession, ConnectionId};

#[derive(Debug, ThisError, PartialEq, Eq, Clone)]
pub enum Error {
    #[error("connection error; {0} is already registered")]
    DuplicateConnection(ConnectionId),
    #[error("connection error; {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// The Store owns the transfer state of every connected client, keyed by connection.
///
/// It is not shared: a single owner mutates it from the event dispatch loop, so no locking is
/// involved.
#[derive(Debug, Default)]
pub struct Store {
    sessions: HashMap<ConnectionId, ClientSession>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    pub fn register(&mut self, id: ConnectionId) -> Result<&mut ClientSession, Error> {
        if self.sessions.contains_key(&id) {
            return Err(Error::DuplicateConnection(id));
        }

        Ok(self.sessions.entry(id).or_default())
    }

    pub fn get(&self, id: &ConnectionId) -> Result<&ClientSession, Error> {
        self.sessions
            .get(id)
            .ok_or(Error::UnknownConnection(*id))
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Result<&mut ClientSession, Error> {
        self.sessions
            .get_mut(id)
            .ok_or(Error::UnknownConnection(*id))
    }

    /// Removes the session of `id`, returning whether the store is now empty.
    pub fn remove(&mut self, id: &ConnectionId) -> Result<bool, Error> {
        self.sessions
            .remove(id)
            .ok_or(Error::UnknownConnection(*id))?;

        Ok(self.sessions.is_empty())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, ClientSession)> + '_ {
        self.sessions.drain()
    }
}
