//! Relay Session
//!
//! One accepted connection, from role resolution to teardown. The forward
//! flow (client to peer and third party) runs on the session task; the
//! reverse flow (peer to client) runs on a task of its own. Whichever flow
//! finishes first fires the session's [`CloseGate`] and the other one lets go
//! of its socket halves, so every socket is released exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::copier::{PatternCopier, Rewrite, LINE_DELIMITER};
use super::dialer::PeerDialer;
use super::role::{Role, RoleResolver};
use crate::config::Config;
use crate::Result;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Accepted = 0,
    Identified = 1,
    Dialing = 2,
    Forwarding = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Accepted,
            1 => SessionState::Identified,
            2 => SessionState::Dialing,
            3 => SessionState::Forwarding,
            _ => SessionState::Closed,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Source address matched neither peer
    Unrecognized,
    /// No destination could be dialed
    Unreachable,
    /// Both flows ran and finished
    Forwarded,
}

/// Everything a session needs that is shared across sessions
#[derive(Debug)]
pub struct RelayContext {
    pub resolver: RoleResolver,
    pub dialer: PeerDialer,
    pub rewrite: Rewrite,
}

impl RelayContext {
    pub fn new(resolver: RoleResolver, dialer: PeerDialer, rewrite: Rewrite) -> Self {
        Self {
            resolver,
            dialer,
            rewrite,
        }
    }

    /// Build the context from configuration, compiling the rewrite rule once
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            RoleResolver::from_config(&config.peers),
            PeerDialer::from_config(config),
            Rewrite::server_ip(config.relay.local_ip())?,
        ))
    }
}

/// Fires once when the first flow of a session finishes
#[derive(Debug, Clone)]
pub struct CloseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the gate. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is closed
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a dropped channel
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents one relayed connection
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub start_time: Instant,
    role: OnceLock<Role>,
    state: AtomicU8,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl RelaySession {
    /// Create a new session for an accepted connection
    pub fn new(session_id: String, client_addr: SocketAddr) -> Self {
        debug!(session_id = %session_id, remote = %client_addr, "Creating relay session");

        Self {
            session_id,
            client_addr,
            start_time: Instant::now(),
            role: OnceLock::new(),
            state: AtomicU8::new(SessionState::Accepted as u8),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Resolved role, once identified
    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bytes forwarded from the client to each destination
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes returned from the peer to the client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn transition(&self, to: SessionState) {
        let from = SessionState::from_u8(self.state.swap(to as u8, Ordering::AcqRel));
        debug!(session_id = %self.session_id, "Session state {:?} -> {:?}", from, to);
    }

    /// Drive the session to completion. The client socket is always closed
    /// by the time this returns.
    pub async fn run(self: Arc<Self>, client: TcpStream, context: Arc<RelayContext>) -> SessionOutcome {
        let Some(role) = context.resolver.resolve(self.client_addr) else {
            warn!(session_id = %self.session_id, remote = %self.client_addr, "Source is not a recognized peer");
            drop(client);
            self.transition(SessionState::Closed);
            return SessionOutcome::Unrecognized;
        };

        let _ = self.role.set(role);
        self.transition(SessionState::Identified);
        info!(session_id = %self.session_id, remote = %self.client_addr, role = %role, "Identified {} peer", role);

        self.transition(SessionState::Dialing);
        let destinations = context.dialer.dial(role).await;
        if destinations.is_empty() {
            warn!(
                session_id = %self.session_id,
                remote = %self.client_addr,
                "No destination is ready for forwarding, closing client"
            );
            drop(client);
            self.transition(SessionState::Closed);
            return SessionOutcome::Unreachable;
        }

        self.transition(SessionState::Forwarding);

        let (client_read, client_write) = client.into_split();
        let (peer_read, peer_write) = match destinations.peer {
            Some(peer) => {
                let (read, write) = peer.into_split();
                (Some(read), Some(write))
            }
            None => (None, None),
        };
        // Nothing is ever read back from the third party
        let third_party_write = destinations.third_party.map(|stream| stream.into_split().1);

        let mut writers: Vec<OwnedWriteHalf> = Vec::with_capacity(2);
        writers.extend(peer_write);
        writers.extend(third_party_write);

        let gate = CloseGate::new();

        let reverse = tokio::spawn(Arc::clone(&self).reverse_flow(peer_read, client_write, gate.clone()));

        self.forward_flow(client_read, writers, &context.rewrite, &gate).await;

        if let Err(e) = reverse.await {
            error!(session_id = %self.session_id, "Reverse flow task failed: {}", e);
        }

        self.transition(SessionState::Closed);
        self.log_stats();
        SessionOutcome::Forwarded
    }

    /// Client to peer and third party, rewriting each line
    async fn forward_flow(
        &self,
        client_read: OwnedReadHalf,
        mut writers: Vec<OwnedWriteHalf>,
        rewrite: &Rewrite,
        gate: &CloseGate,
    ) {
        let mut copier = PatternCopier::new(LINE_DELIMITER, Some(rewrite));

        let result = tokio::select! {
            result = copier.copy(client_read, &mut writers) => Some(result),
            _ = gate.closed() => None,
        };
        self.bytes_up.store(copier.written(), Ordering::Relaxed);

        match result {
            Some(Ok(bytes)) => {
                debug!(session_id = %self.session_id, remote = %self.client_addr, "Client finished sending after {} bytes", bytes)
            }
            Some(Err(e)) => {
                warn!(session_id = %self.session_id, remote = %self.client_addr, "Forwarding from client failed: {}", e)
            }
            None => debug!(session_id = %self.session_id, "Forward flow stopped by reverse flow"),
        }

        for writer in writers.iter_mut() {
            let _ = writer.shutdown().await;
        }
        drop(writers);
        gate.close();
    }

    /// Peer to client, verbatim
    async fn reverse_flow(
        self: Arc<Self>,
        peer_read: Option<OwnedReadHalf>,
        mut client_write: OwnedWriteHalf,
        gate: CloseGate,
    ) {
        let Some(mut peer_read) = peer_read else {
            // No peer: stay idle and leave teardown to the forward flow
            gate.closed().await;
            return;
        };

        let result = tokio::select! {
            result = tokio::io::copy(&mut peer_read, &mut client_write) => Some(result),
            _ = gate.closed() => None,
        };

        match result {
            Some(Ok(bytes)) => {
                self.bytes_down.store(bytes, Ordering::Relaxed);
                debug!(session_id = %self.session_id, "Peer finished sending after {} bytes", bytes);
            }
            Some(Err(e)) => {
                warn!(session_id = %self.session_id, remote = %self.client_addr, "Returning data to client failed: {}", e)
            }
            None => debug!(session_id = %self.session_id, "Reverse flow stopped by forward flow"),
        }

        let _ = client_write.shutdown().await;
        drop(peer_read);
        drop(client_write);
        gate.close();
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            remote = %self.client_addr,
            role = ?self.role(),
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            "Relay session closed"
        );
    }
}
