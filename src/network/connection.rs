//! A single peer connection
//!
//! Each connection runs a read loop driving the protocol state machine and a
//! writer task that is the only writer of the socket. Everything else talks to
//! the peer by queueing frames or offers on the connection's outbound channel.
//!
//! ```text
//! CONNECTING --version/verack--> ACTIVE --error/close--> DISCONNECTED
//!      \__________________timeout/violation_______________/
//! ```

use dashmap::DashSet;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::MessageCodec;
use super::message::{
    Message, VersionMessage, MAX_ADDR_ENTRIES, MAX_INV_ENTRIES, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
use super::pool::NetworkContext;
use super::requests::RequestOwner;
use crate::core::{unix_time, DecodeError, InventoryVector, NetworkAddress, ObjectMessage, Services};

/// How often a sync connection checks whether it is done
const SYNC_TICK: Duration = Duration::from_secs(1);

/// A sync connection without outstanding requests finishes after this much
/// silence
const SYNC_QUIET_PERIOD: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Network-related errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("No data received within the read timeout")]
    ReadTimeout,
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Incompatible protocol version {0}")]
    IncompatibleVersion(u32),
    #[error("No common stream")]
    NoCommonStream,
    #[error("Connected to ourselves")]
    SelfConnection,
    #[error("Unexpected {0} during handshake")]
    UnexpectedMessage(&'static str),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Connection pool already started")]
    AlreadyStarted,
    #[error("Connection pool not started")]
    NotStarted,
}

/// Who opened the connection and what it is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// We connected out
    Client,
    /// The peer connected in
    Server,
    /// Outbound, fetching a trusted node's objects until done or timed out
    Sync,
}

/// Connection state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Active = 1,
    Disconnected = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Connecting,
            1 => State::Active,
            _ => State::Disconnected,
        }
    }
}

/// Work for the writer task
#[derive(Debug)]
pub enum Outbound {
    Frame(Message),
    /// Announce one vector; consecutive offers are sent as a single `inv`
    Offer(InventoryVector),
}

/// Receiving end of a connection's outbound channel, consumed by `run`
pub type OutboundQueue = mpsc::UnboundedReceiver<Outbound>;

/// Outcome of an `object` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First copy: stored, announced to the listener and queued for gossip
    Stored { released_request: bool },
    /// Already in the inventory
    Duplicate { released_request: bool },
    /// Failed validation and was dropped
    Invalid,
}

type FrameSink<S> = SplitSink<Framed<S, MessageCodec>, Message>;
type FrameStream<S> = SplitStream<Framed<S, MessageCodec>>;

pub struct Connection {
    /// Unique per process; owns this connection's request claims
    id: RequestOwner,
    mode: Mode,
    remote: SocketAddr,
    state: AtomicU8,
    /// Vectors the peer has or was offered; only grows
    known: DashSet<InventoryVector>,
    /// Vectors this connection requested and still waits for
    outstanding: DashSet<InventoryVector>,
    streams: OnceLock<Vec<u64>>,
    peer_version: OnceLock<VersionMessage>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
    context: Arc<NetworkContext>,
    created: Instant,
    /// Millis after `created` of the last inventory or object traffic
    last_activity: AtomicU64,
    sync_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(
        mode: Mode,
        remote: SocketAddr,
        context: Arc<NetworkContext>,
    ) -> (Arc<Self>, OutboundQueue) {
        Self::build(mode, remote, context, None)
    }

    /// A sync connection finishing at `timeout` at the latest
    pub fn sync(
        remote: SocketAddr,
        context: Arc<NetworkContext>,
        timeout: Duration,
    ) -> (Arc<Self>, OutboundQueue) {
        Self::build(Mode::Sync, remote, context, Some(Instant::now() + timeout))
    }

    fn build(
        mode: Mode,
        remote: SocketAddr,
        context: Arc<NetworkContext>,
        sync_deadline: Option<Instant>,
    ) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let connection = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            remote,
            state: AtomicU8::new(State::Connecting as u8),
            known: DashSet::new(),
            outstanding: DashSet::new(),
            streams: OnceLock::new(),
            peer_version: OnceLock::new(),
            outbound,
            closed: context.shutdown.child_token(),
            context,
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
            sync_deadline,
        };
        (Arc::new(connection), queue)
    }

    pub fn id(&self) -> RequestOwner {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == State::Active
    }

    /// Streams agreed on during the handshake; empty before that
    pub fn streams(&self) -> &[u64] {
        self.streams.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn peer_version(&self) -> Option<&VersionMessage> {
        self.peer_version.get()
    }

    pub fn knows_of(&self, vector: &InventoryVector) -> bool {
        self.known.contains(vector)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Announce a vector to the peer unless it already knows it.
    /// Returns whether an offer was queued.
    pub fn offer(&self, vector: InventoryVector) -> bool {
        if !self.is_active() || !self.known.insert(vector) {
            return false;
        }
        self.outbound.send(Outbound::Offer(vector)).is_ok()
    }

    /// Ask the read loop to stop; the connection becomes Disconnected
    pub fn disconnect(&self) {
        self.state
            .store(State::Disconnected as u8, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn send(&self, message: Message) {
        // Fails only once the writer is gone, which means we are closing
        let _ = self.outbound.send(Outbound::Frame(message));
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drive the connection over an established stream until it ends
    pub async fn run<S>(self: Arc<Self>, stream: S, queue: OutboundQueue) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, MessageCodec);
        let (sink, mut frames) = framed.split();
        let writer = tokio::spawn(Arc::clone(&self).write_loop(sink, queue));

        let result = self.drive(&mut frames).await;
        match &result {
            Ok(()) => log::info!("Connection to {} closed", self.remote),
            Err(e) => log::warn!("Connection to {} failed: {}", self.remote, e),
        }

        self.release();
        let _ = writer.await;
        result
    }

    async fn drive<S>(&self, frames: &mut FrameStream<S>) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake_timeout = self.context.config.handshake_timeout;
        tokio::select! {
            _ = self.closed.cancelled() => return Ok(()),
            result = time::timeout(handshake_timeout, self.handshake(frames)) => {
                result.map_err(|_| NetworkError::HandshakeTimeout)??;
            }
        }

        self.activate();
        self.receive_loop(frames).await
    }

    /// Mark disconnected and give up this connection's pending requests
    fn release(&self) {
        self.disconnect();
        for vector in self.outstanding.iter() {
            self.context.requests.release(&vector, self.id);
        }
        self.outstanding.clear();
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn version_message(&self) -> VersionMessage {
        let config = &self.context.config;
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: Services::NODE_NETWORK,
            timestamp: unix_time(),
            addr_recv: NetworkAddress::from_socket_addr(self.remote, 0, 0),
            addr_from: NetworkAddress::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.context.listen_port,
                0,
                0,
            ),
            nonce: self.context.nonce,
            user_agent: config.user_agent.clone(),
            streams: config.streams.clone(),
        }
    }

    async fn handshake<S>(&self, frames: &mut FrameStream<S>) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.mode != Mode::Server {
            self.send(Message::Version(self.version_message()));
        }

        let mut version_received = false;
        let mut verack_received = false;
        while !(version_received && verack_received) {
            let message = frames.next().await.ok_or(NetworkError::Disconnected)??;
            match message {
                Message::Version(version) if !version_received => {
                    self.accept_version(version)?;
                    version_received = true;
                    self.send(Message::Verack);
                    if self.mode == Mode::Server {
                        self.send(Message::Version(self.version_message()));
                    }
                }
                Message::Verack if !verack_received => verack_received = true,
                other => return Err(NetworkError::UnexpectedMessage(other.command())),
            }
        }
        Ok(())
    }

    fn accept_version(&self, version: VersionMessage) -> Result<(), NetworkError> {
        if version.version < MIN_PROTOCOL_VERSION {
            return Err(NetworkError::IncompatibleVersion(version.version));
        }
        if version.nonce == self.context.nonce {
            return Err(NetworkError::SelfConnection);
        }
        let common: Vec<u64> = self
            .context
            .config
            .streams
            .iter()
            .copied()
            .filter(|stream| version.streams.contains(stream))
            .collect();
        if common.is_empty() {
            return Err(NetworkError::NoCommonStream);
        }

        log::debug!(
            "{} speaks version {} ({}), streams {:?}",
            self.remote,
            version.version,
            version.user_agent,
            common
        );
        let _ = self.streams.set(common);
        let _ = self.peer_version.set(version);
        Ok(())
    }

    /// Handshake done: share addresses and inventory, remember the peer
    fn activate(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                State::Connecting as u8,
                State::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !transitioned {
            return;
        }
        log::info!("Connection to {} active ({:?})", self.remote, self.mode);
        self.touch();

        let streams = self.streams().to_vec();
        if self.mode != Mode::Sync {
            let addresses = self
                .context
                .registry
                .known_addresses(MAX_ADDR_ENTRIES, &streams);
            if !addresses.is_empty() {
                self.send(Message::Addr(addresses));
            }

            let inventory = self.context.inventory.inventory(&streams);
            for chunk in inventory.chunks(MAX_INV_ENTRIES) {
                for vector in chunk {
                    self.known.insert(*vector);
                }
                self.send(Message::Inv(chunk.to_vec()));
            }
        }

        // Inbound peers listen on the port they advertise, not the one they
        // connected from
        let port = match (self.mode, self.peer_version()) {
            (Mode::Server, Some(version)) => version.addr_from.port,
            _ => self.remote.port(),
        };
        if port != 0 {
            let now = unix_time();
            let addresses = streams
                .iter()
                .map(|stream| NetworkAddress::new(self.remote.ip(), port, *stream, now))
                .collect();
            self.context.registry.offer_addresses(addresses);
        }
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    async fn receive_loop<S>(&self, frames: &mut FrameStream<S>) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.context.config.read_timeout;
        let mut deadline = Instant::now() + read_timeout;
        let mut ticker = time::interval(SYNC_TICK);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                _ = time::sleep_until(deadline) => return Err(NetworkError::ReadTimeout),
                _ = ticker.tick(), if self.mode == Mode::Sync => {
                    if self.sync_finished() {
                        log::info!("Synchronization with {} finished", self.remote);
                        return Ok(());
                    }
                }
                frame = frames.next() => {
                    let message = match frame {
                        Some(result) => result?,
                        None => return Ok(()),
                    };
                    deadline = Instant::now() + read_timeout;
                    self.handle(message);
                }
            }
        }
    }

    fn sync_finished(&self) -> bool {
        let Some(deadline) = self.sync_deadline else {
            return false;
        };
        Instant::now() >= deadline
            || (self.pending_count() == 0 && self.quiet_for() >= SYNC_QUIET_PERIOD)
    }

    /// Outstanding requests still worth waiting for. Objects that arrived
    /// through another peer and claims now held by someone else are dropped.
    fn pending_count(&self) -> usize {
        let inventory = &self.context.inventory;
        let requests = &self.context.requests;
        self.outstanding.retain(|vector| {
            !inventory.contains(vector) && requests.owner(vector) == Some(self.id)
        });
        self.outstanding.len()
    }

    fn handle(&self, message: Message) {
        log::trace!("Received {} from {}", message.command(), self.remote);
        match message {
            Message::Inv(vectors) => self.receive_inventory(vectors),
            Message::GetData(vectors) => {
                for vector in vectors {
                    if let Some(object) = self.context.inventory.get(&vector) {
                        self.known.insert(vector);
                        self.send(Message::Object(object));
                    }
                }
            }
            Message::Object(object) => {
                self.receive_object(object);
            }
            Message::Addr(addresses) => self.context.registry.offer_addresses(addresses),
            Message::Ping => self.send(Message::Pong),
            Message::Pong => {}
            Message::Custom(custom) => {
                if let Some(reply) = self.context.listener.custom(self.remote, &custom) {
                    self.send(Message::Custom(reply));
                }
            }
            Message::Version(_) | Message::Verack => {
                log::debug!("Ignoring repeated handshake message from {}", self.remote);
            }
        }
    }

    fn receive_inventory(&self, vectors: Vec<InventoryVector>) {
        self.touch();
        let mut wanted = Vec::new();
        for vector in vectors {
            self.known.insert(vector);
            if !self.context.inventory.contains(&vector)
                && self.context.requests.try_request(vector, self.id)
            {
                self.outstanding.insert(vector);
                wanted.push(vector);
            }
        }
        if !wanted.is_empty() {
            log::debug!("Requesting {} objects from {}", wanted.len(), self.remote);
            self.send(Message::GetData(wanted));
        }
    }

    /// Validate and store an object received from this peer
    pub fn receive_object(&self, object: ObjectMessage) -> Delivery {
        let config = &self.context.config;
        let vector = object.inventory_vector();
        if let Err(e) = object.validate(
            &config.streams,
            config.nonce_trials_per_byte,
            config.extra_bytes,
            unix_time(),
        ) {
            log::debug!("Dropping object {} from {}: {}", vector, self.remote, e);
            // Stop waiting for it; the shared claim expires on its own
            self.outstanding.remove(&vector);
            return Delivery::Invalid;
        }

        let stored = self.context.inventory.put(&object);
        let released_request = self.context.requests.remove(&vector);
        self.outstanding.remove(&vector);
        self.known.insert(vector);
        self.touch();

        if !stored {
            return Delivery::Duplicate { released_request };
        }
        log::debug!("Received object {} from {}", vector, self.remote);
        self.context.listener.receive(&object);
        let _ = self.context.gossip.send(vector);
        Delivery::Stored { released_request }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    async fn write_loop<S>(self: Arc<Self>, mut sink: FrameSink<S>, mut queue: OutboundQueue)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let keepalive = self.context.config.keepalive;
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = time::timeout(keepalive, queue.recv()) => next,
            };
            let result = match next {
                Ok(Some(item)) => self.write(&mut sink, &mut queue, item).await,
                Ok(None) => break,
                // Nothing written for a while
                Err(_) => sink.send(Message::Ping).await,
            };
            if let Err(e) = result {
                log::warn!("Write to {} failed: {}", self.remote, e);
                self.disconnect();
                break;
            }
        }
    }

    async fn write<S>(
        &self,
        sink: &mut FrameSink<S>,
        queue: &mut OutboundQueue,
        item: Outbound,
    ) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = match item {
            Outbound::Frame(message) => return sink.send(message).await,
            Outbound::Offer(vector) => vector,
        };

        let mut vectors = vec![first];
        let mut pending = None;
        while vectors.len() < MAX_INV_ENTRIES {
            match queue.try_recv() {
                Ok(Outbound::Offer(vector)) => vectors.push(vector),
                Ok(Outbound::Frame(message)) => {
                    pending = Some(message);
                    break;
                }
                Err(_) => break,
            }
        }

        sink.send(Message::Inv(vectors)).await?;
        if let Some(message) = pending {
            sink.send(message).await?;
        }
        Ok(())
    }
}
