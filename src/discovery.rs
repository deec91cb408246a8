//! Peer candidate discovery.
//!
//! A discovery strategy produces a snapshot of gossip endpoints that may be
//! worth joining. Snapshots are best-effort: they can contain the local node,
//! dead nodes, or nodes already in the cluster. The membership layer shuffles
//! and filters; discovery only enumerates.

use std::time::Duration;

use parking_lot::RwLock;

/// A candidate gossip endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Enumerates candidate cluster endpoints.
///
/// The network behind a strategy can be local, WAN, or anything else that can
/// resolve to `host:port` pairs.
pub trait Discovery: Send + Sync + 'static {
    /// Current snapshot of candidates.
    fn discover(&self) -> Vec<Endpoint>;

    /// How often the membership layer should re-run discovery.
    fn period(&self) -> Duration;
}

/// Discovery over a fixed host with a mutable port list.
///
/// Ports can be added at runtime, which lets an operator stitch two disjoint
/// clusters together by seeding one endpoint from the other side.
pub struct Localhost {
    host: String,
    ports: RwLock<Vec<String>>,
    period: Duration,
}

impl Localhost {
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            ports: RwLock::new(ports),
            period: Duration::from_secs(1),
        }
    }

    pub fn with_period(ports: Vec<String>, period: Duration) -> Self {
        Self {
            period,
            ..Self::new(ports)
        }
    }

    pub fn add_port(&self, port: impl Into<String>) {
        self.ports.write().push(port.into());
    }
}

impl Discovery for Localhost {
    fn discover(&self) -> Vec<Endpoint> {
        self.ports
            .read()
            .iter()
            .map(|port| Endpoint::new(self.host.clone(), port.clone()))
            .collect()
    }

    fn period(&self) -> Duration {
        self.period
    }
}
