//! Outbound connections for a relay session

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::role::{Role, RoleResolver};
use crate::config::Config;
use crate::Result;

/// Connections opened for one session. Either side may be absent.
#[derive(Debug, Default)]
pub struct Destinations {
    pub peer: Option<TcpStream>,
    pub third_party: Option<TcpStream>,
}

impl Destinations {
    /// True when no destination could be reached
    pub fn is_empty(&self) -> bool {
        self.peer.is_none() && self.third_party.is_none()
    }
}

/// Opens the peer and third-party connections a role needs
#[derive(Debug, Clone)]
pub struct PeerDialer {
    resolver: RoleResolver,
    port: u16,
    third_party: Option<String>,
    dial_timeout: Duration,
}

impl PeerDialer {
    pub fn new(
        resolver: RoleResolver,
        port: u16,
        third_party: Option<String>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            port,
            third_party,
            dial_timeout,
        }
    }

    /// Create a dialer from configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RoleResolver::from_config(&config.peers),
            config.relay.port,
            config.third_party.clone(),
            config.relay.dial_timeout,
        )
    }

    /// Address of the peer that receives traffic from `role`
    pub fn peer_addr(&self, role: Role) -> SocketAddr {
        SocketAddr::new(self.resolver.peer_ip(role.other()), self.port)
    }

    /// Dial the destinations for `role`.
    ///
    /// A failed dial is logged and yields an absent connection; it never
    /// prevents the other dial from being attempted.
    pub async fn dial(&self, role: Role) -> Destinations {
        let peer_addr = self.peer_addr(role);
        let peer = match self.connect(peer_addr).await {
            Ok(stream) => {
                info!("Connected to {} peer at {}", role.other(), peer_addr);
                Some(stream)
            }
            Err(e) => {
                warn!("Failed to connect to {} peer at {}: {:#}", role.other(), peer_addr, e);
                None
            }
        };

        let third_party = match (&self.third_party, role.mirrors_to_third_party()) {
            (Some(addr), true) => match self.connect_host(addr).await {
                Ok(stream) => {
                    info!("Connected to third party at {}", addr);
                    Some(stream)
                }
                Err(e) => {
                    warn!("Failed to connect to third party at {}: {:#}", addr, e);
                    None
                }
            },
            _ => None,
        };

        Destinations { peer, third_party }
    }

    /// Resolve a `host:port` string and connect to the first address that answers
    async fn connect_host(&self, host_port: &str) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = timeout(self.dial_timeout, lookup_host(host_port))
            .await
            .map_err(|_| anyhow!("DNS resolution timed out for {}", host_port))?
            .with_context(|| format!("DNS resolution failed for {}", host_port))?
            .collect();

        debug!("Resolved {} to {} addresses", host_port, addrs.len());

        let mut last_error = None;
        for addr in addrs {
            match self.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("No addresses resolved for {}", host_port)))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(anyhow!("Connection failed: {}", e)),
            Err(_) => Err(anyhow!("Connection timed out after {:?}", self.dial_timeout)),
        }
    }
}
