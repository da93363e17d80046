//! Peer roles and source identification

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::PeersConfig;

/// Which configured peer a connection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Role 0: traffic is rewritten and mirrored to the third party
    Downstream,
    /// Role 1: traffic is forwarded to the downstream peer only
    Upstream,
}

impl Role {
    /// Positional index of the role in the configured peer pair
    pub fn index(self) -> usize {
        match self {
            Role::Downstream => 0,
            Role::Upstream => 1,
        }
    }

    /// The role on the other end of the relay
    pub fn other(self) -> Role {
        match self {
            Role::Downstream => Role::Upstream,
            Role::Upstream => Role::Downstream,
        }
    }

    /// Whether sessions of this role also dial the third party
    pub fn mirrors_to_third_party(self) -> bool {
        matches!(self, Role::Downstream)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Downstream => write!(f, "downstream"),
            Role::Upstream => write!(f, "upstream"),
        }
    }
}

/// Maps a remote address onto one of the two configured peers
#[derive(Debug, Clone)]
pub struct RoleResolver {
    peers: [IpAddr; 2],
}

impl RoleResolver {
    pub fn new(downstream: IpAddr, upstream: IpAddr) -> Self {
        Self {
            peers: [downstream.to_canonical(), upstream.to_canonical()],
        }
    }

    pub fn from_config(config: &PeersConfig) -> Self {
        Self::new(config.downstream, config.upstream)
    }

    /// Configured address of `role`
    pub fn peer_ip(&self, role: Role) -> IpAddr {
        self.peers[role.index()]
    }

    /// Resolve the role of `remote`, or `None` if it matches neither peer.
    ///
    /// The port is ignored. Downstream is checked first.
    pub fn resolve(&self, remote: SocketAddr) -> Option<Role> {
        let ip = remote.ip().to_canonical();

        [Role::Downstream, Role::Upstream]
            .into_iter()
            .find(|role| self.peers[role.index()] == ip)
    }
}
