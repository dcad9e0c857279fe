//! Connection pool and gossip
//!
//! The pool owns the listening socket and every tracked connection. It keeps
//! the number of active connections near a target, and spreads newly stored
//! objects by offering their vectors to a random subset of peers that do not
//! know them yet.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, Mode, NetworkError, State};
use super::listener::MessageListener;
use super::requests::RequestTable;
use crate::core::{
    InventoryVector, NetworkAddress, NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE,
};
use crate::storage::{resolve_bootstrap, Inventory, NodeRegistry};

/// Default port of the Bitmessage network
pub const DEFAULT_PORT: u16 = 8444;

/// Network configuration; missing fields in a config file take the defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: IpAddr,
    /// Port to listen on; 0 picks a free one
    pub port: u16,
    /// Streams this node serves
    pub streams: Vec<u64>,
    /// Target number of active connections
    pub connection_limit: usize,
    /// Maximum number of peers a vector is offered to at once
    pub fanout: usize,
    pub maintenance_interval: Duration,
    pub handshake_timeout: Duration,
    /// Idle peers are dropped after this long without a frame
    pub read_timeout: Duration,
    /// A ping is sent after this long without writing
    pub keepalive: Duration,
    pub request_expiry: Duration,
    pub connect_timeout: Duration,
    /// Minimum proof-of-work difficulty accepted from peers
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            streams: vec![1],
            connection_limit: 8,
            fanout: 8,
            maintenance_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(600),
            keepalive: Duration::from_secs(300),
            request_expiry: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
            extra_bytes: NETWORK_EXTRA_BYTES,
            user_agent: format!("/mini-bitmessage:{}/", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Everything a connection shares with the pool
pub struct NetworkContext {
    pub config: NetworkConfig,
    /// Port we advertise in `version` messages
    pub listen_port: u16,
    /// Random per-node value used to detect connections to ourselves
    pub nonce: u64,
    pub inventory: Arc<dyn Inventory>,
    pub registry: Arc<dyn NodeRegistry>,
    pub listener: Arc<dyn MessageListener>,
    pub requests: Arc<RequestTable>,
    /// Vectors of newly stored objects, to be offered to other peers
    pub gossip: mpsc::UnboundedSender<InventoryVector>,
    pub shutdown: CancellationToken,
}

/// Active connections of one stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub incoming: usize,
    pub outgoing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub running: bool,
    pub streams: BTreeMap<u64, StreamStatus>,
}

impl NetworkStatus {
    pub fn total(&self) -> usize {
        self.streams
            .values()
            .map(|status| status.incoming + status.outgoing)
            .sum()
    }
}

pub struct ConnectionPool {
    config: NetworkConfig,
    nonce: u64,
    inventory: Arc<dyn Inventory>,
    registry: Arc<dyn NodeRegistry>,
    requests: Arc<RequestTable>,
    connections: Mutex<Vec<Arc<Connection>>>,
    context: OnceLock<Arc<NetworkContext>>,
    gossip_tx: mpsc::UnboundedSender<InventoryVector>,
    gossip_rx: Mutex<Option<mpsc::UnboundedReceiver<InventoryVector>>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        config: NetworkConfig,
        inventory: Arc<dyn Inventory>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(RequestTable::new(config.request_expiry));
        Self {
            config,
            nonce: rand::random(),
            inventory,
            registry,
            requests,
            connections: Mutex::new(Vec::new()),
            context: OnceLock::new(),
            gossip_tx,
            gossip_rx: Mutex::new(Some(gossip_rx)),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Sender for vectors to be offered to peers, e.g. for objects we created
    pub fn gossip_sender(&self) -> mpsc::UnboundedSender<InventoryVector> {
        self.gossip_tx.clone()
    }

    pub fn requests(&self) -> &Arc<RequestTable> {
        &self.requests
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn make_context(&self, listener: Arc<dyn MessageListener>, listen_port: u16) -> NetworkContext {
        NetworkContext {
            config: self.config.clone(),
            listen_port,
            nonce: self.nonce,
            inventory: Arc::clone(&self.inventory),
            registry: Arc::clone(&self.registry),
            listener,
            requests: Arc::clone(&self.requests),
            gossip: self.gossip_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Bind the listening socket and start the accept, maintenance and
    /// gossip tasks. A pool can only be started once.
    pub async fn start(
        self: &Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<SocketAddr, NetworkError> {
        let gossip = self
            .gossip_rx
            .lock()
            .await
            .take()
            .ok_or(NetworkError::AlreadyStarted)?;

        let socket = TcpListener::bind((self.config.listen_address, self.config.port)).await?;
        let local = socket.local_addr()?;
        log::info!("Listening on {}", local);

        let context = Arc::new(self.make_context(listener, local.port()));
        let _ = self.context.set(Arc::clone(&context));
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(Arc::clone(self).accept_loop(socket));
        tokio::spawn(Arc::clone(self).maintenance_loop());
        tokio::spawn(Arc::clone(self).gossip_loop(gossip));
        Ok(local)
    }

    /// Stop maintenance, close the listener and disconnect every peer
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping connection pool");
        self.shutdown.cancel();
        for connection in self.connections.lock().await.iter() {
            connection.disconnect();
        }
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    async fn accept_loop(self: Arc<Self>, socket: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::info!("Incoming connection from {}", remote);
                        if let Err(e) = self.start_connection(Mode::Server, stream, remote).await {
                            log::debug!("Rejected {}: {}", remote, e);
                        }
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                }
            }
        }
        log::debug!("Accept loop finished");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.maintain().await,
            }
        }
        log::debug!("Maintenance loop finished");
    }

    async fn maintain(self: &Arc<Self>) {
        let active = {
            let mut connections = self.connections.lock().await;
            connections.retain(|c| c.state() != State::Disconnected);
            connections.iter().filter(|c| c.is_active()).count()
        };

        let expired = self.requests.purge_expired();
        let cleaned = self.inventory.cleanup();
        if expired > 0 || cleaned > 0 {
            log::debug!("Expired {} requests, removed {} old objects", expired, cleaned);
        }

        let target = self.config.connection_limit;
        if active >= target {
            return;
        }
        let mut addresses = self
            .registry
            .known_addresses(target - active, &self.config.streams);
        if addresses.is_empty() {
            addresses = self.bootstrap(target - active).await;
        }
        log::debug!(
            "{} of {} connections active, trying {} addresses",
            active,
            target,
            addresses.len()
        );
        for address in addresses {
            let pool = Arc::clone(self);
            let remote = address.socket_addr();
            tokio::spawn(async move {
                if let Err(e) = pool.connect(remote).await {
                    log::debug!("Could not connect to {}: {}", remote, e);
                }
            });
        }
    }

    /// Nothing known yet: resolve the registry's bootstrap hosts and retry
    async fn bootstrap(&self, limit: usize) -> Vec<NetworkAddress> {
        let hosts: Vec<(u64, String)> = self
            .registry
            .bootstrap_hosts()
            .into_iter()
            .filter(|(stream, _)| self.config.streams.contains(stream))
            .collect();
        if hosts.is_empty() {
            return Vec::new();
        }
        log::debug!("No known nodes, resolving {} bootstrap hosts", hosts.len());
        self.registry.offer_addresses(resolve_bootstrap(&hosts).await);
        self.registry.known_addresses(limit, &self.config.streams)
    }

    async fn gossip_loop(self: Arc<Self>, mut gossip: mpsc::UnboundedReceiver<InventoryVector>) {
        loop {
            let vector = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                vector = gossip.recv() => match vector {
                    Some(vector) => vector,
                    None => break,
                },
            };
            let offered = self.offer(vector).await;
            log::trace!("Offered {} to {} peers", vector, offered);
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open an outbound connection. Returns `false` if that peer is already
    /// connected.
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<bool, NetworkError> {
        if self.is_tracked(remote).await {
            return Ok(false);
        }
        let stream = time::timeout(self.config.connect_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| NetworkError::ConnectTimeout)??;
        log::info!("Connected to {}", remote);
        self.start_connection(Mode::Client, stream, remote).await
    }

    async fn is_tracked(&self, remote: SocketAddr) -> bool {
        self.connections
            .lock()
            .await
            .iter()
            .any(|c| c.remote() == remote && c.state() != State::Disconnected)
    }

    /// Track a connection over an open socket and spawn its tasks
    async fn start_connection(
        &self,
        mode: Mode,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<bool, NetworkError> {
        let context = self.context.get().ok_or(NetworkError::NotStarted)?;
        if self.shutdown.is_cancelled() {
            return Err(NetworkError::Disconnected);
        }

        let mut connections = self.connections.lock().await;
        if connections
            .iter()
            .any(|c| c.remote() == remote && c.state() != State::Disconnected)
        {
            log::debug!("Already connected to {}", remote);
            return Ok(false);
        }

        let (connection, queue) = Connection::new(mode, remote, Arc::clone(context));
        connections.push(Arc::clone(&connection));
        tokio::spawn(connection.run(stream, queue));
        Ok(true)
    }

    /// Snapshot of the tracked connections
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.clone()
    }

    /// Offer a vector to at most `fanout` random active peers that do not
    /// know it yet. Returns the number of peers it was offered to.
    pub async fn offer(&self, vector: InventoryVector) -> usize {
        let connections = self.connections.lock().await;
        let candidates: Vec<&Arc<Connection>> = connections
            .iter()
            .filter(|c| c.is_active() && !c.knows_of(&vector))
            .collect();

        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, self.config.fanout)
            .filter(|c| c.offer(vector))
            .count()
    }

    pub async fn network_status(&self) -> NetworkStatus {
        let mut streams: BTreeMap<u64, StreamStatus> = self
            .config
            .streams
            .iter()
            .map(|stream| (*stream, StreamStatus::default()))
            .collect();

        for connection in self.connections.lock().await.iter() {
            if !connection.is_active() {
                continue;
            }
            for stream in connection.streams() {
                let status = streams.entry(*stream).or_default();
                match connection.mode() {
                    Mode::Server => status.incoming += 1,
                    Mode::Client | Mode::Sync => status.outgoing += 1,
                }
            }
        }

        NetworkStatus {
            running: self.is_running(),
            streams,
        }
    }

    /// Fetch everything a trusted node has. The connection is not tracked by
    /// the pool and ends once nothing is left to fetch or `timeout` passes.
    pub fn synchronize(
        &self,
        remote: SocketAddr,
        timeout: Duration,
        listener: Arc<dyn MessageListener>,
    ) -> JoinHandle<Result<(), NetworkError>> {
        let listen_port = self
            .context
            .get()
            .map_or(self.config.port, |context| context.listen_port);
        let context = Arc::new(self.make_context(listener, listen_port));
        let connect_timeout = self.config.connect_timeout;

        tokio::spawn(async move {
            let stream = time::timeout(connect_timeout, TcpStream::connect(remote))
                .await
                .map_err(|_| NetworkError::ConnectTimeout)??;
            log::info!("Synchronizing with {}", remote);
            let (connection, queue) = Connection::sync(remote, context, timeout);
            connection.run(stream, queue).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{unix_time, NetworkAddress, ObjectMessage, HOUR};
    use crate::pow::SimplePowEngine;
    use crate::storage::{MemoryInventory, MemoryNodeRegistry};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            maintenance_interval: Duration::from_secs(3600),
            nonce_trials_per_byte: 1,
            extra_bytes: 1,
            ..NetworkConfig::default()
        }
    }

    struct Node {
        pool: Arc<ConnectionPool>,
        inventory: Arc<MemoryInventory>,
        received: Arc<AtomicUsize>,
    }

    impl Node {
        fn listener(&self) -> Arc<dyn MessageListener> {
            let received = Arc::clone(&self.received);
            Arc::new(move |_: &ObjectMessage| {
                received.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn node(config: NetworkConfig, peers: &[SocketAddr]) -> Node {
        let inventory = Arc::new(MemoryInventory::new());
        let registry = Arc::new(MemoryNodeRegistry::new());
        let addresses = peers
            .iter()
            .map(|peer| NetworkAddress::from_socket_addr(*peer, 1, unix_time()))
            .collect();
        registry.offer_addresses(addresses);
        Node {
            pool: Arc::new(ConnectionPool::new(config, inventory.clone(), registry)),
            inventory,
            received: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn started(config: NetworkConfig, peers: &[SocketAddr]) -> (Node, SocketAddr) {
        let node = node(config, peers);
        let address = node.pool.start(node.listener()).await.unwrap();
        (node, address)
    }

    fn stamped_object(body: &[u8]) -> ObjectMessage {
        let now = unix_time();
        let mut object = ObjectMessage::new(now + HOUR, 42, 1, 1, body.to_vec());
        let target = object.target(1, 1, now);
        object.nonce = SimplePowEngine::search(&object.initial_hash(), &target);
        object
    }

    async fn active_count(pool: &ConnectionPool) -> usize {
        pool.connections()
            .await
            .iter()
            .filter(|c| c.is_active())
            .count()
    }

    async fn wait_for_active(pool: &ConnectionPool, count: usize) {
        time::timeout(Duration::from_secs(10), async {
            while active_count(pool).await < count {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_until(check: impl Fn() -> bool) {
        time::timeout(Duration::from_secs(10), async {
            while !check() {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let (node, _) = started(test_config(), &[]).await;
        assert!(node.pool.is_running());
        assert!(matches!(
            node.pool.start(node.listener()).await,
            Err(NetworkError::AlreadyStarted)
        ));

        node.pool.stop().await;
        assert!(!node.pool.is_running());
        assert!(!node.pool.network_status().await.running);
    }

    #[tokio::test]
    async fn test_maintenance_connects_and_gossips() {
        let (a, a_address) = started(test_config(), &[]).await;
        let (b, _) = started(test_config(), &[a_address]).await;

        wait_for_active(&a.pool, 1).await;
        wait_for_active(&b.pool, 1).await;

        let status = a.pool.network_status().await;
        assert_eq!(status.streams[&1], StreamStatus { incoming: 1, outgoing: 0 });
        let status = b.pool.network_status().await;
        assert_eq!(status.streams[&1], StreamStatus { incoming: 0, outgoing: 1 });

        // A new object travels through the gossip channel to the peer
        let object = stamped_object(b"gossip");
        let vector = object.inventory_vector();
        assert!(a.inventory.put(&object));
        a.pool.gossip_sender().send(vector).unwrap();

        let inventory = Arc::clone(&b.inventory);
        wait_until(move || inventory.contains(&vector)).await;
        assert_eq!(b.received.load(Ordering::SeqCst), 1);
        assert!(!b.pool.requests().contains(&vector));

        // B re-offers it, but A already knows it
        assert_eq!(b.pool.offer(vector).await, 0);

        a.pool.stop().await;
        b.pool.stop().await;
    }

    #[tokio::test]
    async fn test_maintenance_resolves_bootstrap_hosts() {
        let (a, a_address) = started(test_config(), &[]).await;

        let registry =
            MemoryNodeRegistry::with_bootstrap(&format!("[stream 1]\n{}\n", a_address)).unwrap();
        assert!(registry.known_addresses(8, &[1]).is_empty());
        let inventory = Arc::new(MemoryInventory::new());
        let b = Node {
            pool: Arc::new(ConnectionPool::new(
                test_config(),
                inventory.clone(),
                Arc::new(registry),
            )),
            inventory,
            received: Arc::new(AtomicUsize::new(0)),
        };
        b.pool.start(b.listener()).await.unwrap();

        wait_for_active(&b.pool, 1).await;
        assert_eq!(b.pool.connections().await[0].remote(), a_address);

        a.pool.stop().await;
        b.pool.stop().await;
    }

    #[tokio::test]
    async fn test_offer_is_bounded_and_non_redundant() {
        let hub_config = NetworkConfig {
            fanout: 2,
            ..test_config()
        };
        let (hub, hub_address) = started(hub_config, &[]).await;
        let mut spokes = Vec::new();
        for _ in 0..4 {
            spokes.push(started(test_config(), &[hub_address]).await.0);
        }
        wait_for_active(&hub.pool, 4).await;

        let vector = InventoryVector::new([0x42; 32]);
        assert_eq!(hub.pool.offer(vector).await, 2);
        assert_eq!(hub.pool.offer(vector).await, 2);
        assert_eq!(hub.pool.offer(vector).await, 0);

        let connections = hub.pool.connections().await;
        assert!(connections.iter().all(|c| c.knows_of(&vector)));

        hub.pool.stop().await;
        for spoke in spokes {
            spoke.pool.stop().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_connections_are_rejected() {
        let (a, a_address) = started(test_config(), &[]).await;
        let (b, _) = started(test_config(), &[]).await;

        assert!(b.pool.connect(a_address).await.unwrap());
        assert!(!b.pool.connect(a_address).await.unwrap());
        assert_eq!(b.pool.connections().await.len(), 1);

        wait_for_active(&b.pool, 1).await;
        assert!(!b.pool.connect(a_address).await.unwrap());

        a.pool.stop().await;
        b.pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_everyone() {
        let (a, a_address) = started(test_config(), &[]).await;
        let (b, _) = started(test_config(), &[a_address]).await;
        wait_for_active(&b.pool, 1).await;

        b.pool.stop().await;
        let connections = b.pool.connections().await;
        assert!(connections.iter().all(|c| c.state() == State::Disconnected));
        assert_eq!(b.pool.network_status().await.total(), 0);

        // A notices the closed socket
        time::timeout(Duration::from_secs(10), async {
            while active_count(&a.pool).await > 0 {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        a.pool.stop().await;
    }

    #[tokio::test]
    async fn test_connect_requires_start() {
        let node = node(test_config(), &[]);
        let (_, address) = started(test_config(), &[]).await;
        assert!(matches!(
            node.pool.connect(address).await,
            Err(NetworkError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_synchronize_fetches_everything() {
        let (a, a_address) = started(test_config(), &[]).await;
        let objects: Vec<_> = (0..3u8).map(|i| stamped_object(&[i; 16])).collect();
        for object in &objects {
            a.inventory.put(object);
        }

        let b = node(test_config(), &[]);
        let result = b
            .pool
            .synchronize(a_address, Duration::from_secs(20), b.listener())
            .await
            .unwrap();
        assert!(result.is_ok());

        for object in &objects {
            assert!(b.inventory.contains(&object.inventory_vector()));
        }
        assert_eq!(b.received.load(Ordering::SeqCst), 3);
        // Sync connections are never tracked
        assert!(b.pool.connections().await.is_empty());
        a.pool.stop().await;
    }
}
