use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::wire::{self, Envelope};
use crate::{Error, Result};

pub mod registry;
pub(crate) mod tls;

use registry::{Client, Registry};

/// How long a closing handler waits for its peer to hang up, so a final
/// Error reply can land before the connection handle drops.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// The broker: accepts connections, spawns one handler per client and
/// coordinates shutdown with the registry.
pub struct Server {
    endpoint: Endpoint,
    pub(crate) registry: Arc<Registry>,
}

impl Server {
    /// Bind the listening endpoint. Failing here is fatal for the
    /// process; nothing has been spawned yet.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let endpoint = Endpoint::server(tls::server_config()?, addr)?;

        Ok(Server {
            endpoint,
            registry: Arc::new(Registry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(Error::IO)
    }

    /// Accept connections until `cancel` fires, then close every
    /// registered client and wait for the endpoint to drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        log::info!("listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = self.endpoint.accept() => {
                    // a drained accept means the endpoint is gone
                    let Some(incoming) = incoming else { break };

                    let registry = Arc::clone(&self.registry);
                    let cancel = cancel.child_token();
                    // serve one client
                    tokio::spawn(async move {
                        let connection = match incoming.await {
                            Ok(connection) => connection,
                            Err(err) => {
                                log::warn!("failed to accept connection: {}", err);
                                return;
                            }
                        };

                        if let Err(err) = handle(connection, registry, cancel).await {
                            log::debug!("client connection closed: {}", err);
                        }
                    });
                }
            }
        }

        log::info!("shutting down");
        self.registry.close_all().await;
        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
        self.endpoint.wait_idle().await;

        Ok(())
    }
}

async fn handle(
    connection: Connection,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> Result<()> {
    // exactly one bidirectional stream per connection; anything else
    // the peer opens is never accepted
    let (send, recv) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        stream = connection.accept_bi() => stream?,
    };

    let mut handler = Handler {
        registry,
        cancel,
        connection,
        recv,
        send: Arc::new(Mutex::new(send)),
        id: None,
    };

    let result = handler.run().await;

    if let Some(id) = handler.id.take() {
        handler.registry.remove(&id).await;
        log::info!("client '{}' disconnected", id);
    }

    let _ = handler.send.lock().await.finish();
    let _ = tokio::time::timeout(CLOSE_GRACE, handler.connection.closed()).await;

    result
}

/// Per-connection state machine: handshake once, then route until the
/// stream dies.
struct Handler {
    registry: Arc<Registry>,
    cancel: CancellationToken,
    connection: Connection,
    recv: RecvStream,
    // send half of the session stream; shared with the registry record
    // once the client registers
    send: Arc<Mutex<SendStream>>,
    // set after a successful registration, for deferred self-cleanup
    id: Option<String>,
}

impl Handler {
    async fn run(&mut self) -> Result<()> {
        let id = self.register().await?;
        self.id = Some(id.clone());
        log::info!("client '{}' registered", id);

        loop {
            let (to, content) = match self.read().await? {
                Envelope::Message { to_id, content, .. } => (to_id, content),
                // a second Register counts as a violation too
                _ => {
                    let _ = self.reply(wire::ERR_UNEXPECTED_MESSAGE).await;
                    return Err(Error::UnexpectedEnvelope);
                }
            };

            self.route(&id, to, content).await?;
        }
    }

    /// The first envelope must be a Register with a valid ID that the
    /// registry accepts. Every refusal is reported back before closing.
    async fn register(&mut self) -> Result<String> {
        let id = match self.read().await? {
            Envelope::Register { from } => from,
            _ => {
                let _ = self.reply(wire::ERR_FIRST_NOT_REGISTER).await;
                return Err(Error::UnexpectedEnvelope);
            }
        };

        if !wire::valid_client_id(&id) {
            let _ = self.reply(wire::ERR_INVALID_CLIENT_ID).await;
            return Err(Error::InvalidClientId);
        }

        let client = Client::new(self.connection.clone(), Arc::clone(&self.send));
        if let Err(err) = self.registry.add(&id, client).await {
            let _ = self.reply(&err.to_string()).await;
            return Err(err);
        }

        Ok(id)
    }

    /// Forward one message. Routing failures are reported to the sender
    /// and leave the session open; only a failed reply ends it.
    async fn route(&mut self, from: &str, to: String, content: String) -> Result<()> {
        if content.chars().count() > wire::MAX_CONTENT_CHARS {
            return self.reply(wire::ERR_CONTENT_TOO_LARGE).await;
        }

        let Some(client) = self.registry.get(&to).await else {
            return self.reply(wire::ERR_NOT_REGISTERED).await;
        };

        log::debug!("routing message from '{}' to '{}'", from, to);

        // the session identity is authoritative, whatever from_id the
        // sender put on the wire
        let envelope = Envelope::Message {
            from_id: from.into(),
            to_id: to.clone(),
            content,
        };

        if let Err(err) = client.write(&envelope).await {
            log::warn!("failed to forward to '{}': {}", to, err);
            // the recipient is dead; evict it so lookups stop finding it
            self.registry.remove(&to).await;
            return self.reply(wire::ERR_DISCONNECTED).await;
        }

        Ok(())
    }

    async fn read(&mut self) -> Result<Envelope> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Closed),
            envelope = wire::read(&mut self.recv) => envelope,
        }
    }

    async fn reply(&self, error: &str) -> Result<()> {
        let envelope = Envelope::Error {
            error: error.into(),
        };

        let mut send = self.send.lock().await;
        wire::write(&mut *send, &envelope).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    async fn spawn_server() -> (
        SocketAddr,
        Arc<Registry>,
        CancellationToken,
        JoinHandle<Result<()>>,
    ) {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let registry = Arc::clone(&server.registry);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        (addr, registry, cancel, handle)
    }

    async fn wait_for_count(registry: &Registry, count: usize) {
        timeout(Duration::from_secs(5), async {
            while registry.count().await != count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }

    #[tokio::test]
    async fn test_register() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let _alice = client::connect(addr, "alice").await.unwrap();
        wait_for_count(&registry, 1).await;
    }

    #[tokio::test]
    async fn test_duplicate_id() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let _alice = client::connect(addr, "alice").await.unwrap();
        wait_for_count(&registry, 1).await;

        let mut imposter = client::connect(addr, "alice").await.unwrap();
        let err = imposter.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_DUPLICATE_ID));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_capacity() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut clients = Vec::new();
        for index in 1..=registry::MAX_CLIENTS {
            let id = format!("client{}", index);
            clients.push(client::connect(addr, &id).await.unwrap());
        }
        wait_for_count(&registry, registry::MAX_CLIENTS).await;

        let mut extra = client::connect(addr, "client17").await.unwrap();
        let err = extra.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_CAPACITY_REACHED));
        assert_eq!(registry.count().await, registry::MAX_CLIENTS);
    }

    #[tokio::test]
    async fn test_routing() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        let mut bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        alice.send("bob", "Hello Bob!").await.unwrap();

        let (from, content) = bob.receive().await.unwrap();
        assert_eq!(from, "alice");
        assert_eq!(content, "Hello Bob!");
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        wait_for_count(&registry, 1).await;

        alice.send("charlie", "anyone there?").await.unwrap();
        let err = alice.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_NOT_REGISTERED));

        // the sender's session survives the failed route
        let mut bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        alice.send("bob", "second try").await.unwrap();
        let (from, content) = bob.receive().await.unwrap();
        assert_eq!(from, "alice");
        assert_eq!(content, "second try");
    }

    #[tokio::test]
    async fn test_oversize_content() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        let mut bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        let content = "x".repeat(wire::MAX_CONTENT_CHARS + 1);
        alice.send("bob", &content).await.unwrap();

        let err = alice.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_CONTENT_TOO_LARGE));

        // bob never saw the oversize message
        alice.send("bob", "after").await.unwrap();
        let (_, content) = bob.receive().await.unwrap();
        assert_eq!(content, "after");
    }

    #[tokio::test]
    async fn test_from_id_overwritten() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        let mut bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        // forge the sender identity on the wire
        let envelope = Envelope::Message {
            from_id: "mallory".into(),
            to_id: "bob".into(),
            content: "who am i".into(),
        };
        wire::write(&mut alice.send, &envelope).await.unwrap();

        let (from, content) = bob.receive().await.unwrap();
        assert_eq!(from, "alice");
        assert_eq!(content, "who am i");
    }

    #[tokio::test]
    async fn test_first_message_must_register() {
        let (addr, _registry, _cancel, _handle) = spawn_server().await;

        let endpoint = client::endpoint().unwrap();
        let connection = endpoint
            .connect_with(client::config().unwrap(), addr, wire::SERVER_NAME)
            .unwrap()
            .await
            .unwrap();
        let (mut send, mut recv) = connection.open_bi().await.unwrap();

        let envelope = Envelope::Message {
            from_id: "alice".into(),
            to_id: "bob".into(),
            content: "too early".into(),
        };
        wire::write(&mut send, &envelope).await.unwrap();

        let reply = wire::read(&mut recv).await.unwrap();
        assert_eq!(
            reply,
            Envelope::Error {
                error: wire::ERR_FIRST_NOT_REGISTER.into(),
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_client_id() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let endpoint = client::endpoint().unwrap();
        let connection = endpoint
            .connect_with(client::config().unwrap(), addr, wire::SERVER_NAME)
            .unwrap()
            .await
            .unwrap();
        let (mut send, mut recv) = connection.open_bi().await.unwrap();

        let envelope = Envelope::Register {
            from: "x".repeat(wire::MAX_CLIENT_ID_CHARS + 1),
        };
        wire::write(&mut send, &envelope).await.unwrap();

        let reply = wire::read(&mut recv).await.unwrap();
        assert_eq!(
            reply,
            Envelope::Error {
                error: wire::ERR_INVALID_CLIENT_ID.into(),
            }
        );
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_second_register() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        wait_for_count(&registry, 1).await;

        let envelope = Envelope::Register {
            from: "alice2".into(),
        };
        wire::write(&mut alice.send, &envelope).await.unwrap();

        let err = alice.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_UNEXPECTED_MESSAGE));
    }

    #[tokio::test]
    async fn test_eviction() {
        let (addr, registry, _cancel, _handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        let bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        bob.close().await;
        wait_for_count(&registry, 1).await;

        alice.send("bob", "are you there?").await.unwrap();
        let err = alice.receive().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg == wire::ERR_NOT_REGISTERED));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (addr, registry, cancel, handle) = spawn_server().await;

        let mut alice = client::connect(addr, "alice").await.unwrap();
        let mut bob = client::connect(addr, "bob").await.unwrap();
        wait_for_count(&registry, 2).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(alice.receive().await.is_err());
        assert!(bob.receive().await.is_err());
        assert_eq!(registry.count().await, 0);
    }
}
