//! Cluster topology as seen by the client.
//!
//! The view is written by a discovery collaborator (or by servers pushing
//! updates over HA connections) and read by the locator and the failover
//! coordinator when choosing where to connect.

use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RavenClientError;

/// Address of a server acceptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Endpoint at `host:port`
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = RavenClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RavenClientError::invalid_config(format!("Endpoint '{}' has no port", s)))?;
        if host.is_empty() {
            return Err(RavenClientError::invalid_config(format!(
                "Endpoint '{}' has no host",
                s
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            RavenClientError::invalid_config(format!("Endpoint '{}' has an invalid port", s))
        })?;
        Ok(Endpoint::new(host, port))
    }
}

/// One live server and its optional backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyMember {
    pub node_id: String,
    pub live: Endpoint,
    pub backup: Option<Endpoint>,
}

impl TopologyMember {
    /// Member serving `live`, with its backup if known
    pub fn new<N: Into<String>>(node_id: N, live: Endpoint, backup: Option<Endpoint>) -> Self {
        Self {
            node_id: node_id.into(),
            live,
            backup,
        }
    }
}

#[derive(Debug)]
struct TopologyState {
    members: Vec<TopologyMember>,
    version: u64,
}

/// Ordered, versioned list of known servers
#[derive(Debug, Clone)]
pub struct TopologyView {
    state: Arc<RwLock<TopologyState>>,
    notifier: Arc<watch::Sender<u64>>,
}

impl Default for TopologyView {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyView {
    /// Empty view at version 0
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(TopologyState {
                members: Vec::new(),
                version: 0,
            })),
            notifier: Arc::new(notifier),
        }
    }

    /// Insert a member, or replace the member with the same node id in place
    pub fn update_member(&self, member: TopologyMember) -> u64 {
        let version = {
            let mut state = self.state.write();
            match state
                .members
                .iter_mut()
                .find(|m| m.node_id == member.node_id)
            {
                Some(existing) if *existing == member => return state.version,
                Some(existing) => *existing = member.clone(),
                None => state.members.push(member.clone()),
            }
            state.version += 1;
            state.version
        };

        debug!(node_id = %member.node_id, live = %member.live, version, "Topology member up");
        self.notifier.send_replace(version);
        version
    }

    /// Remove a member; returns whether it was known
    pub fn remove_member(&self, node_id: &str) -> bool {
        let version = {
            let mut state = self.state.write();
            let before = state.members.len();
            state.members.retain(|m| m.node_id != node_id);
            if state.members.len() == before {
                return false;
            }
            state.version += 1;
            state.version
        };

        debug!(node_id, version, "Topology member down");
        self.notifier.send_replace(version);
        true
    }

    /// Bumped on every change
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Snapshot of the members in order
    pub fn members(&self) -> Vec<TopologyMember> {
        self.state.read().members.clone()
    }

    /// Whether no member is known
    pub fn is_empty(&self) -> bool {
        self.state.read().members.is_empty()
    }

    /// Live endpoints of all known members
    pub fn live_endpoints(&self) -> Vec<Endpoint> {
        self.state
            .read()
            .members
            .iter()
            .map(|m| m.live.clone())
            .collect()
    }

    /// Member whose live endpoint is `endpoint`
    pub fn member_for_live(&self, endpoint: &Endpoint) -> Option<TopologyMember> {
        self.state
            .read()
            .members
            .iter()
            .find(|m| &m.live == endpoint)
            .cloned()
    }

    /// Backup of the server reachable at `endpoint`, if one is known
    pub fn backup_for(&self, endpoint: &Endpoint) -> Option<Endpoint> {
        self.member_for_live(endpoint).and_then(|m| m.backup)
    }

    /// Receive the version number whenever the view changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }
}
