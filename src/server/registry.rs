use std::collections::HashMap;
use std::sync::Arc;

use quinn::{Connection, SendStream, VarInt};
use tokio::sync::{Mutex, RwLock};

use crate::{wire, wire::Envelope, Error, Result};

/// Hard global limit on concurrently registered clients.
pub const MAX_CLIENTS: usize = 16;

/// A registered client: the connection it arrived on and the send half
/// of its single bidirectional stream.
///
/// The stream sits behind a mutex because both the owning handler (error
/// replies) and every routing handler (forwards) write to it. Holding
/// the mutex across a full `wire::write` keeps frames contiguous.
#[derive(Clone)]
pub struct Client {
    connection: Connection,
    stream: Arc<Mutex<SendStream>>,
}

impl Client {
    pub fn new(connection: Connection, stream: Arc<Mutex<SendStream>>) -> Self {
        Client { connection, stream }
    }

    /// Write one envelope to this client's stream.
    pub async fn write(&self, envelope: &Envelope) -> Result<()> {
        let mut stream = self.stream.lock().await;
        wire::write(&mut *stream, envelope).await
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"server shutdown");
    }
}

/// The server's authoritative map from client ID to live session.
///
/// Reads take the shared lock, mutations the exclusive lock. No I/O
/// happens under the lock; `get` hands out a cheap clone instead.
pub struct Registry {
    clients: RwLock<HashMap<String, Client>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            clients: RwLock::new(HashMap::default()),
        }
    }

    /// Register `id`. Fails without side effects if the ID is taken or
    /// the registry is full.
    pub async fn add(&self, id: &str, client: Client) -> Result<()> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(id) {
            return Err(Error::DuplicateClient);
        }
        if clients.len() >= MAX_CLIENTS {
            return Err(Error::RegistryFull);
        }

        clients.insert(id.into(), client);
        Ok(())
    }

    /// Drop the record for `id`, if any. Idempotent.
    pub async fn remove(&self, id: &str) {
        self.clients.write().await.remove(id);
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close every registered connection and clear the map. The closes
    /// unblock each handler's pending read and drive it to cleanup.
    pub async fn close_all(&self) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.close();
        }

        clients.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
