//! Cluster coordinator.
//!
//! Owns the peer table, the local store, the batching outbox, and the RPC
//! server, and glues them to gossip membership: joins add a connected peer
//! client plus its slot-ring address, leaves remove both. Operations route
//! by hash slot; anything non-local rides the batcher and comes back as an
//! indexed reply.

pub mod commands;
pub mod errors;
pub mod membership;
pub mod slots;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher;
use crate::discovery::Discovery;
use crate::rpc::{Client, Codec, HandlersError, ListenError, MsgpackCodec, Server};
use crate::store::{Store, StoreConfig, StoreError};

pub use commands::{
    BatchArgs, BatchReply, Command, CommandHandlers, CommandReply, DeleteArgs, DeleteReply,
    GetArgs, GetReply, METHOD_BATCH, METHOD_DELETE, METHOD_GET, METHOD_SET, SetArgs, SetReply,
};
pub use errors::{DeleteError, GetError, KeyOwnerError, SetError};
pub use membership::{
    DEFAULT_GOSSIP_PORT, EventCallbacks, Member, MemberCallback, MemberList, MemberListConfig,
    MembershipError,
};
pub use slots::{HashSlot, MAX_HASH_SLOT, NodeAddress, SlotRange, closest_address, slot};

use commands::KeyRequest;

/// Outbox capacity and upper bound on a single flush.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Wall-clock deadline for a request to be observed and completed by a
/// batch.
const SEND_REQUEST_DEADLINE: Duration = Duration::from_secs(5);

/// Backoff schedule for connecting to a freshly joined peer.
const CONNECT_RETRY_ATTEMPTS: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("handler registration failed: {0}")]
    Handlers(#[from] HandlersError),
    #[error("listen failed: {0}")]
    Listen(#[from] ListenError),
    #[error("gossip startup failed: {0}")]
    Membership(#[from] MembershipError),
    #[error("metadata encoding failed: {0}")]
    Metadata(#[source] serde_json::Error),
}

pub struct ClusterConfig {
    /// Host for both the RPC server and the gossip socket.
    pub host: String,
    /// Server-to-server RPC port.
    pub port: String,
    /// UDP port for gossip membership.
    pub gossip_port: u16,
    /// Outbox capacity; also the largest batch handed to one flush.
    pub batch_size: usize,
    /// Local store tuning, including removal hooks.
    pub store: StoreConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: "7000".to_string(),
            gossip_port: DEFAULT_GOSSIP_PORT,
            batch_size: DEFAULT_BATCH_SIZE,
            store: StoreConfig::default(),
        }
    }
}

/// Gossip metadata advertising a node's RPC endpoint, distinct from its
/// gossip endpoint.
#[derive(Debug, Serialize, Deserialize)]
struct ClusterMetadata {
    host: String,
    port: String,
}

/// Connected peers and their ring addresses, kept in lockstep:
/// `addresses[0]` is always self and `addresses[i + 1]` belongs to
/// `clients[i]`.
struct PeerTable {
    clients: Vec<Client>,
    addresses: Vec<NodeAddress>,
}

struct ClusterState {
    self_address: NodeAddress,
    peers: RwLock<PeerTable>,
    handlers: CommandHandlers,
}

impl ClusterState {
    fn has_peer(&self, host: &str, port: &str) -> bool {
        self.peers
            .read()
            .clients
            .iter()
            .any(|client| client.host() == host && client.port() == port)
    }

    fn client_for(&self, host: &str, port: &str) -> Option<Client> {
        self.peers
            .read()
            .clients
            .iter()
            .find(|client| client.host() == host && client.port() == port)
            .cloned()
    }

    /// Insert a connected client unless its endpoint is already present.
    fn adopt_peer(&self, client: Client) -> bool {
        let mut peers = self.peers.write();
        let duplicate = peers
            .clients
            .iter()
            .any(|existing| existing.host() == client.host() && existing.port() == client.port());
        if duplicate {
            return false;
        }

        info!(node = %self.self_address, peer = %client.address(), "peer connected");
        peers
            .addresses
            .push(NodeAddress::new(client.host(), client.port()));
        peers.clients.push(client);
        true
    }
}

/// A node of the distributed cache.
pub struct Cluster {
    state: Arc<ClusterState>,
    store: Arc<Store>,
    outbox: mpsc::Sender<Arc<KeyRequest>>,
    membership: MemberList,
    shutdown: CancellationToken,
    codec: MsgpackCodec,
}

impl Cluster {
    /// Start a node: bind the RPC server, start the batcher, and join the
    /// cluster through gossip over the given discovery strategy.
    pub async fn join(
        config: ClusterConfig,
        disco: Arc<dyn Discovery>,
    ) -> Result<Self, ClusterError> {
        let shutdown = CancellationToken::new();

        let store = Arc::new(Store::new(config.store));
        Store::start_janitor(store.clone(), shutdown.clone());

        let self_address = NodeAddress::new(config.host.clone(), config.port.clone());
        let handlers = CommandHandlers::new(store.clone());
        let state = Arc::new(ClusterState {
            self_address: self_address.clone(),
            peers: RwLock::new(PeerTable {
                clients: Vec::new(),
                addresses: vec![self_address],
            }),
            handlers: handlers.clone(),
        });

        let server = Server::new(config.host.clone(), config.port.clone());
        server.register_handlers(&handlers)?;
        let listener = server.listen().await?;
        {
            let server = server.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                server.accept_connections(listener, token).await;
            });
        }

        let outbox = {
            let state = state.clone();
            batcher::run(config.batch_size, move |batch: Vec<Arc<KeyRequest>>| {
                let state = state.clone();
                async move { run_batch(&state, batch).await }
            })
        };

        let metadata = serde_json::to_vec(&ClusterMetadata {
            host: config.host.clone(),
            port: config.port.clone(),
        })
        .map_err(ClusterError::Metadata)?;

        let callbacks = EventCallbacks {
            on_join: Some(on_member_join(state.clone())),
            on_leave: Some(on_member_leave(state.clone())),
            on_update: None,
        };

        let membership = MemberList::new(
            MemberListConfig {
                bind_host: config.host,
                bind_port: config.gossip_port,
                metadata,
                callbacks,
            },
            disco,
        )
        .await?;

        Ok(Self {
            state,
            store,
            outbox,
            membership,
            shutdown,
            codec: MsgpackCodec,
        })
    }

    /// Gossip name of this node.
    pub fn name(&self) -> &str {
        self.membership.name()
    }

    /// RPC endpoint of this node.
    pub fn address(&self) -> String {
        self.state.self_address.address()
    }

    /// Number of connected remote peers.
    pub fn peer_count(&self) -> usize {
        self.state.peers.read().clients.len()
    }

    /// Size of the gossip member view, this node included.
    pub fn member_count(&self) -> usize {
        self.membership.member_count()
    }

    pub fn member_names(&self) -> Vec<String> {
        self.membership.member_names()
    }

    /// Read `key`, wherever it lives. Misses, timeouts, and transport
    /// failures all read as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_get(key).await {
            Ok(value) => Some(value),
            Err(GetError::KeyNotFound) => None,
            Err(err) => {
                debug!(%err, key, "get failed");
                None
            }
        }
    }

    /// Read `key` with error detail.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<T, GetError> {
        let owner = self.owner_of(key).map_err(GetError::from)?;

        if owner == self.state.self_address {
            let bytes = self.store.get(key).map_err(|_| GetError::KeyNotFound)?;
            return self.codec.decode(&bytes).map_err(GetError::DecodeFailure);
        }

        let request = KeyRequest::new(Command::Get(GetArgs {
            key: key.to_string(),
        }));
        self.send_request(request.clone()).await;

        match request.take_reply() {
            Some(CommandReply::Get(reply)) if reply.exists => self
                .codec
                .decode(&reply.value_bytes)
                .map_err(GetError::DecodeFailure),
            _ => Err(GetError::KeyNotFound),
        }
    }

    /// Write `key` on its owner. Best-effort: once the value is handed to a
    /// batch, transport failures and deadline misses are not surfaced.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SetError> {
        let owner = self.owner_of(key).map_err(SetError::from)?;

        let mut value_bytes = Vec::new();
        self.codec
            .encode(value, &mut value_bytes)
            .map_err(SetError::EncodeFailure)?;

        if owner == self.state.self_address {
            self.store
                .set(key, value_bytes)
                .map_err(|_| SetError::BlankKey)?;
            return Ok(());
        }

        let request = KeyRequest::new(Command::Set(SetArgs {
            key: key.to_string(),
            value_bytes,
        }));
        self.send_request(request).await;
        Ok(())
    }

    /// Remove `key` on its owner. A key that was never there is success.
    pub async fn delete(&self, key: &str) -> Result<(), DeleteError> {
        let owner = self.owner_of(key).map_err(DeleteError::from)?;

        if owner == self.state.self_address {
            return match self.store.delete(key) {
                Ok(()) | Err(StoreError::NotFound) => Ok(()),
                Err(StoreError::BlankKey) => Err(DeleteError::BlankKey),
            };
        }

        let request = KeyRequest::new(Command::Delete(DeleteArgs {
            key: key.to_string(),
        }));
        self.send_request(request).await;
        Ok(())
    }

    /// Announce departure, stop the server, and drop every peer connection.
    pub async fn shutdown(&self, timeout: Duration) {
        self.membership.shutdown(timeout).await;
        self.shutdown.cancel();

        let clients: Vec<Client> = {
            let mut peers = self.state.peers.write();
            peers.addresses.truncate(1);
            std::mem::take(&mut peers.clients)
        };
        for client in clients {
            client.disconnect().await;
        }
        info!(node = %self.state.self_address, "cluster node stopped");
    }

    fn owner_of(&self, key: &str) -> Result<NodeAddress, KeyOwnerError> {
        let peers = self.state.peers.read();
        closest_address(&peers.addresses, key).cloned()
    }

    /// Enqueue a request for the batcher and wait for its completion flag,
    /// bounded by the five second deadline.
    async fn send_request(&self, request: Arc<KeyRequest>) {
        if self.outbox.send(request.clone()).await.is_err() {
            request.complete(None);
            return;
        }
        if !request.wait(SEND_REQUEST_DEADLINE).await {
            warn!(
                key = request.command.key(),
                "request missed the batch completion deadline"
            );
        }
    }
}

/// Flush callback: execute the self-owned slice inline, then one batch RPC
/// per remote owner, scattering replies back by index.
async fn run_batch(state: &ClusterState, batch: Vec<Arc<KeyRequest>>) {
    let mut local: Vec<Arc<KeyRequest>> = Vec::new();
    let mut remote: HashMap<NodeAddress, Vec<Arc<KeyRequest>>> = HashMap::new();

    {
        let peers = state.peers.read();
        for request in batch {
            match closest_address(&peers.addresses, request.command.key()) {
                Ok(owner) if *owner == state.self_address => local.push(request),
                Ok(owner) => remote.entry(owner.clone()).or_default().push(request),
                Err(err) => {
                    warn!(%err, key = request.command.key(), "request has no owner");
                    request.complete(None);
                }
            }
        }
    }

    for request in local {
        let reply = state.handlers.run(&request.command);
        request.complete(Some(reply));
    }

    for (owner, requests) in remote {
        let Some(client) = state.client_for(&owner.host, &owner.port) else {
            warn!(owner = %owner, "no connected client for owner");
            for request in &requests {
                request.complete(None);
            }
            continue;
        };

        let args = BatchArgs {
            requests: requests.iter().map(|request| request.command.clone()).collect(),
        };

        match client.call::<BatchArgs, BatchReply>(METHOD_BATCH, &args).await {
            Ok(reply) => {
                if reply.responses.len() != requests.len() {
                    warn!(
                        owner = %owner,
                        sent = requests.len(),
                        received = reply.responses.len(),
                        "batch reply count mismatch"
                    );
                }
                for (index, request) in requests.iter().enumerate() {
                    request.complete(reply.responses.get(index).cloned());
                }
            }
            Err(err) => {
                // Fatal for this batch only; the client stays usable.
                warn!(%err, owner = %owner, "batch call failed");
                for request in &requests {
                    request.complete(None);
                }
            }
        }
    }
}

fn decode_metadata(member: &Member) -> Option<ClusterMetadata> {
    match serde_json::from_slice(&member.metadata) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!(%err, name = %member.name, "failed to decode member metadata");
            None
        }
    }
}

fn on_member_join(state: Arc<ClusterState>) -> MemberCallback {
    Arc::new(move |member: Member| {
        let state = state.clone();
        async move {
            let Some(metadata) = decode_metadata(&member) else {
                return;
            };

            if metadata.host == state.self_address.host && metadata.port == state.self_address.port
            {
                debug!(host = %metadata.host, port = %metadata.port, "join event for this node");
                return;
            }
            if state.has_peer(&metadata.host, &metadata.port) {
                debug!(host = %metadata.host, port = %metadata.port, "peer already connected");
                return;
            }

            let client = Client::new(metadata.host, metadata.port);
            match client.connect().await {
                Ok(()) => {
                    if !state.adopt_peer(client.clone()) {
                        client.disconnect().await;
                    }
                }
                Err(err) => {
                    warn!(%err, peer = %client.address(), "peer connect failed, retrying in the background");
                    tokio::spawn(retry_connect(state.clone(), client));
                }
            }
        }
        .boxed()
    })
}

/// Bounded background reconnect for a peer whose first connect failed. A
/// peer that stays unreachable re-enters through a later join event.
async fn retry_connect(state: Arc<ClusterState>, client: Client) {
    let mut delay = INITIAL_RETRY_DELAY;
    for attempt in 1..=CONNECT_RETRY_ATTEMPTS {
        tokio::time::sleep(delay).await;
        if state.has_peer(client.host(), client.port()) {
            return;
        }

        match client.connect().await {
            Ok(()) => {
                if !state.adopt_peer(client.clone()) {
                    client.disconnect().await;
                }
                return;
            }
            Err(err) => {
                debug!(%err, attempt, peer = %client.address(), "peer reconnect attempt failed");
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
    warn!(peer = %client.address(), "giving up on peer until the next join event");
}

fn on_member_leave(state: Arc<ClusterState>) -> MemberCallback {
    Arc::new(move |member: Member| {
        let state = state.clone();
        async move {
            let Some(metadata) = decode_metadata(&member) else {
                return;
            };

            let removed = {
                let mut peers = state.peers.write();
                let index = peers.clients.iter().position(|client| {
                    client.host() == metadata.host && client.port() == metadata.port
                });
                match index {
                    Some(index) => {
                        peers.addresses.remove(index + 1);
                        Some(peers.clients.remove(index))
                    }
                    None => None,
                }
            };

            if let Some(client) = removed {
                client.disconnect().await;
                info!(peer = %client.address(), "peer removed");
            }
        }
        .boxed()
    })
}
