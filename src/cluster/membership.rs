//! SWIM-style gossip membership.
//!
//! Nodes carry a fresh UUID name and a small metadata blob (the RPC endpoint
//! for cluster peers). Liveness and membership spread over UDP: a probe loop
//! pings one random member per tick, and every ping/ack piggybacks the full
//! member view plus recent leavers, so views converge without a coordinator.
//!
//! A discovery loop periodically shuffles the candidate endpoints and joins
//! one. The shuffle matters: if the cluster ever splits into groups that each
//! only know their own seeds, a random cross-join from either side is enough
//! for gossip to heal the whole network.
//!
//! Event callbacks run on the gossip task; they may briefly block delivery
//! (connecting to a new peer is the expected heavyweight case).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::{Discovery, Endpoint};

/// Default UDP port for gossip traffic.
pub const DEFAULT_GOSSIP_PORT: u16 = 7949;

/// Upper bound on the metadata blob carried with a member.
pub const MAX_METADATA_LEN: usize = 512;

/// How often the probe loop pings a random member.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// A member with no direct traffic for this long is declared dead.
const FAILURE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a leaver's name suppresses re-adds from stale gossip.
const TOMBSTONE_TTL: Duration = Duration::from_secs(30);

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// How long a join attempt waits for the member view to grow.
const JOIN_WAIT: Duration = Duration::from_secs(1);
const JOIN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("BindFailure: {0}")]
    BindFailure(#[source] std::io::Error),
    #[error("MetadataTooLarge: {0} bytes")]
    MetadataTooLarge(usize),
}

/// One node as seen by the gossip layer. Uniqueness is by `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub metadata: Vec<u8>,
}

impl Member {
    pub fn gossip_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    Ping {
        from: Member,
        members: Vec<Member>,
        left: Vec<String>,
    },
    Ack {
        from: Member,
        members: Vec<Member>,
        left: Vec<String>,
    },
    Join {
        from: Member,
    },
    JoinAck {
        from: Member,
        members: Vec<Member>,
        left: Vec<String>,
    },
    Leave {
        name: String,
    },
}

/// Async membership event callback.
pub type MemberCallback = Arc<dyn Fn(Member) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventCallbacks {
    pub on_join: Option<MemberCallback>,
    pub on_leave: Option<MemberCallback>,
    pub on_update: Option<MemberCallback>,
}

pub struct MemberListConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub metadata: Vec<u8>,
    pub callbacks: EventCallbacks,
}

impl Default for MemberListConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: DEFAULT_GOSSIP_PORT,
            metadata: Vec::new(),
            callbacks: EventCallbacks::default(),
        }
    }
}

struct MemberState {
    member: Member,
    last_seen: Instant,
}

#[derive(Default)]
struct MembershipState {
    /// Remote members by name; the local node is not stored here.
    members: HashMap<String, MemberState>,
    /// Tombstones for recent leavers.
    left: HashMap<String, Instant>,
}

struct MemberListInner {
    local: Member,
    socket: UdpSocket,
    state: Mutex<MembershipState>,
    callbacks: EventCallbacks,
    shutdown: CancellationToken,
}

/// Handle to the gossip layer. Cheap to clone.
#[derive(Clone)]
pub struct MemberList {
    inner: Arc<MemberListInner>,
}

impl MemberList {
    /// Bind the gossip socket and start the receive, probe, and discovery
    /// loops. The local node gets a fresh UUID name.
    pub async fn new(
        config: MemberListConfig,
        disco: Arc<dyn Discovery>,
    ) -> Result<Self, MembershipError> {
        if config.metadata.len() > MAX_METADATA_LEN {
            return Err(MembershipError::MetadataTooLarge(config.metadata.len()));
        }

        let socket = UdpSocket::bind((config.bind_host.as_str(), config.bind_port))
            .await
            .map_err(MembershipError::BindFailure)?;
        let bound_port = socket
            .local_addr()
            .map_err(MembershipError::BindFailure)?
            .port();

        // A wildcard bind address is not reachable by peers; advertise the
        // loopback address instead.
        let advertise_host = if config.bind_host.is_empty() || config.bind_host == "0.0.0.0" {
            "127.0.0.1".to_string()
        } else {
            config.bind_host.clone()
        };

        let local = Member {
            name: Uuid::new_v4().to_string(),
            host: advertise_host,
            port: bound_port,
            metadata: config.metadata,
        };
        info!(name = %local.name, address = %local.gossip_address(), "gossip member list started");

        let list = Self {
            inner: Arc::new(MemberListInner {
                local,
                socket,
                state: Mutex::new(MembershipState::default()),
                callbacks: config.callbacks,
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(list.clone().recv_loop());
        tokio::spawn(list.clone().probe_loop());
        tokio::spawn(list.clone().discovery_loop(disco));

        Ok(list)
    }

    pub fn name(&self) -> &str {
        &self.inner.local.name
    }

    pub fn local_member(&self) -> &Member {
        &self.inner.local
    }

    /// Snapshot of the current view, local node included.
    pub fn members(&self) -> Vec<Member> {
        let state = self.inner.state.lock();
        let mut members = vec![self.inner.local.clone()];
        members.extend(state.members.values().map(|entry| entry.member.clone()));
        members
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members().into_iter().map(|member| member.name).collect()
    }

    pub fn member_count(&self) -> usize {
        self.inner.state.lock().members.len() + 1
    }

    /// Stop the loops, announce departure to every known member, and give
    /// the datagrams a moment to drain. Safe to call more than once.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let targets: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .members
                .values()
                .map(|entry| entry.member.gossip_address())
                .collect()
        };

        let leave = GossipMessage::Leave {
            name: self.inner.local.name.clone(),
        };
        for address in targets {
            self.send(&leave, &address).await;
        }

        tokio::time::sleep(timeout.min(Duration::from_millis(250))).await;
        info!(name = %self.inner.local.name, "gossip member list stopped");
    }

    async fn recv_loop(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                received = self.inner.socket.recv_from(&mut buf) => received,
            };

            let (len, from_addr) = match received {
                Ok(received) => received,
                Err(err) => {
                    warn!(%err, "gossip receive failed");
                    continue;
                }
            };

            let message: GossipMessage = match rmp_serde::from_slice(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    debug!(%err, %from_addr, "ignoring malformed gossip datagram");
                    continue;
                }
            };

            self.handle_message(message).await;
        }
    }

    async fn handle_message(&self, message: GossipMessage) {
        match message {
            GossipMessage::Ping { from, members, left } => {
                let reply_to = from.gossip_address();
                self.observe(Some(from), members, left).await;
                let (members, left) = self.view();
                let ack = GossipMessage::Ack {
                    from: self.inner.local.clone(),
                    members,
                    left,
                };
                self.send(&ack, &reply_to).await;
            }
            GossipMessage::Ack { from, members, left } => {
                self.observe(Some(from), members, left).await;
            }
            GossipMessage::Join { from } => {
                if from.name == self.inner.local.name {
                    // Discovery handed us our own endpoint.
                    return;
                }
                let reply_to = from.gossip_address();
                self.observe(Some(from), Vec::new(), Vec::new()).await;
                let (members, left) = self.view();
                let ack = GossipMessage::JoinAck {
                    from: self.inner.local.clone(),
                    members,
                    left,
                };
                self.send(&ack, &reply_to).await;
            }
            GossipMessage::JoinAck { from, members, left } => {
                self.observe(Some(from), members, left).await;
            }
            GossipMessage::Leave { name } => {
                let removed = {
                    let mut state = self.inner.state.lock();
                    state.left.insert(name.clone(), Instant::now());
                    state.members.remove(&name)
                };
                if let Some(entry) = removed {
                    info!(name = %entry.member.name, address = %entry.member.gossip_address(), "member left");
                    fire(&self.inner.callbacks.on_leave, entry.member).await;
                }
            }
        }
    }

    /// Merge gossip into the local view and deliver the resulting events.
    ///
    /// `direct` is the message sender: only direct traffic refreshes a
    /// member's liveness, so a dead node listed in somebody else's view
    /// cannot keep itself alive.
    async fn observe(&self, direct: Option<Member>, members: Vec<Member>, left: Vec<String>) {
        let mut joined: Vec<Member> = Vec::new();
        let mut removed: Vec<Member> = Vec::new();
        let mut updated: Vec<Member> = Vec::new();

        {
            let mut state = self.inner.state.lock();
            let now = Instant::now();

            for name in left {
                if name == self.inner.local.name {
                    continue;
                }
                state.left.entry(name.clone()).or_insert(now);
                if let Some(entry) = state.members.remove(&name) {
                    removed.push(entry.member);
                }
            }

            if let Some(member) = direct {
                self.merge_one(&mut state, member, true, &mut joined, &mut updated);
            }
            for member in members {
                self.merge_one(&mut state, member, false, &mut joined, &mut updated);
            }
        }

        for member in joined {
            info!(name = %member.name, address = %member.gossip_address(), "member joined");
            fire(&self.inner.callbacks.on_join, member).await;
        }
        for member in removed {
            info!(name = %member.name, "member left");
            fire(&self.inner.callbacks.on_leave, member).await;
        }
        for member in updated {
            fire(&self.inner.callbacks.on_update, member).await;
        }
    }

    fn merge_one(
        &self,
        state: &mut MembershipState,
        member: Member,
        refresh: bool,
        joined: &mut Vec<Member>,
        updated: &mut Vec<Member>,
    ) {
        if member.name == self.inner.local.name || state.left.contains_key(&member.name) {
            return;
        }

        let now = Instant::now();
        match state.members.entry(member.name.clone()) {
            Entry::Occupied(mut entry) => {
                if refresh {
                    entry.get_mut().last_seen = now;
                }
                if entry.get().member != member {
                    entry.get_mut().member = member.clone();
                    updated.push(member);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(MemberState {
                    member: member.clone(),
                    last_seen: now,
                });
                joined.push(member);
            }
        }
    }

    async fn probe_loop(self) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let failed = {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                state.left.retain(|_, since| now.duration_since(*since) < TOMBSTONE_TTL);

                let dead: Vec<String> = state
                    .members
                    .iter()
                    .filter(|(_, entry)| now.duration_since(entry.last_seen) > FAILURE_TIMEOUT)
                    .map(|(name, _)| name.clone())
                    .collect();
                dead.into_iter()
                    .filter_map(|name| state.members.remove(&name))
                    .map(|entry| entry.member)
                    .collect::<Vec<Member>>()
            };
            for member in failed {
                info!(name = %member.name, address = %member.gossip_address(), "member failed");
                fire(&self.inner.callbacks.on_leave, member).await;
            }

            let target = {
                let state = self.inner.state.lock();
                let members: Vec<Member> =
                    state.members.values().map(|entry| entry.member.clone()).collect();
                drop(state);
                members.choose(&mut rand::thread_rng()).cloned()
            };
            if let Some(target) = target {
                let (members, left) = self.view();
                let ping = GossipMessage::Ping {
                    from: self.inner.local.clone(),
                    members,
                    left,
                };
                self.send(&ping, &target.gossip_address()).await;
            }
        }
    }

    async fn discovery_loop(self, disco: Arc<dyn Discovery>) {
        let period = disco.period();
        loop {
            let mut candidates = disco.discover();
            {
                let mut rng = rand::thread_rng();
                candidates.shuffle(&mut rng);
            }

            for candidate in &candidates {
                if self.try_join(candidate).await {
                    // One successful join is enough; gossip spreads the rest.
                    break;
                }
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    }

    /// Send a join to `candidate` and wait briefly for the view to grow
    /// beyond just ourselves.
    async fn try_join(&self, candidate: &Endpoint) -> bool {
        let join = GossipMessage::Join {
            from: self.inner.local.clone(),
        };
        if !self.send(&join, &candidate.address()).await {
            return false;
        }

        let deadline = Instant::now() + JOIN_WAIT;
        while Instant::now() < deadline {
            if self.member_count() > 1 {
                return true;
            }
            tokio::time::sleep(JOIN_POLL).await;
        }
        self.member_count() > 1
    }

    fn view(&self) -> (Vec<Member>, Vec<String>) {
        let state = self.inner.state.lock();
        let mut members = vec![self.inner.local.clone()];
        members.extend(state.members.values().map(|entry| entry.member.clone()));
        let left = state.left.keys().cloned().collect();
        (members, left)
    }

    async fn send(&self, message: &GossipMessage, address: &str) -> bool {
        let bytes = match rmp_serde::to_vec_named(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to encode gossip message");
                return false;
            }
        };

        match self.inner.socket.send_to(&bytes, address).await {
            Ok(_) => true,
            Err(err) => {
                debug!(%err, address, "gossip send failed");
                false
            }
        }
    }
}

async fn fire(callback: &Option<MemberCallback>, member: Member) {
    if let Some(callback) = callback {
        callback(member).await;
    }
}
