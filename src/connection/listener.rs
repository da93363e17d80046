//! Relay Listener
//!
//! Owns the listening socket and spawns one [`RelaySession`] per accepted
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::relay::{RelayContext, RelaySession};
use crate::Result;

/// Decrements the live session count when the session task ends
struct SessionSlot {
    active_sessions: Arc<AtomicUsize>,
}

impl SessionSlot {
    fn acquire(active_sessions: &Arc<AtomicUsize>) -> Self {
        active_sessions.fetch_add(1, Ordering::AcqRel);
        Self {
            active_sessions: Arc::clone(active_sessions),
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accepts connections for both peers on a single port
pub struct RelayListener {
    /// Taken by `run` for the life of the loop; dropped by `close` if never run
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    context: Arc<RelayContext>,
    max_sessions: Option<usize>,
    active_sessions: Arc<AtomicUsize>,
    total_sessions: AtomicUsize,
    shutdown_flag: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayListener {
    /// Bind the listener described by `config`
    pub async fn bind(config: &Config) -> Result<Self> {
        let context = RelayContext::from_config(config)?;
        Self::bind_with_context(config.relay.bind_addr(), Arc::new(context), config.relay.max_sessions).await
    }

    /// Bind `addr` and serve sessions with an existing context
    pub async fn bind_with_context(
        addr: SocketAddr,
        context: Arc<RelayContext>,
        max_sessions: Option<usize>,
    ) -> Result<Self> {
        info!("Binding TCP listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay listener to {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            context,
            max_sessions,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            total_sessions: AtomicUsize::new(0),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    /// Sessions that have not finished yet
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Sessions spawned since the listener was bound
    pub fn total_sessions(&self) -> usize {
        self.total_sessions.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    fn take_listener(&self) -> Option<TcpListener> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Accept connections until [`close`](Self::close) is called.
    ///
    /// The listening socket is released as soon as the loop ends. An accept
    /// error ends the loop and is returned; sessions already running are not
    /// affected.
    pub async fn run(&self) -> Result<()> {
        // Subscribe before taking the socket so a concurrent close is never missed
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let Some(listener) = self.take_listener() else {
            if self.is_closed() {
                info!("Listener closed before the accept loop started");
                return Ok(());
            }
            bail!("Relay accept loop is already running");
        };

        info!("Starting connection acceptance loop on {}", self.local_addr);

        loop {
            if self.is_closed() {
                info!("Listener closed, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            return Err(e).context("Relay accept loop failed");
                        }
                    };

                    info!(remote = %addr, "Accepted connection");

                    if let Some(max) = self.max_sessions {
                        if self.active_sessions() >= max {
                            warn!(remote = %addr, "Session limit {} reached, closing connection", max);
                            drop(stream);
                            continue;
                        }
                    }

                    let slot = SessionSlot::acquire(&self.active_sessions);
                    self.total_sessions.fetch_add(1, Ordering::Relaxed);

                    let session = Arc::new(RelaySession::new(Uuid::new_v4().to_string(), addr));
                    let context = Arc::clone(&self.context);

                    tokio::spawn(async move {
                        let _slot = slot;
                        let outcome = session.clone().run(stream, context).await;
                        debug!(
                            session_id = %session.session_id,
                            remote = %addr,
                            "Session ended after {:?}: {:?}", session.duration(), outcome
                        );
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Received close signal, stopping connection acceptance");
                    break;
                }
            }
        }

        drop(listener);
        info!("Connection acceptance loop stopped, {} released", self.local_addr);
        Ok(())
    }

    /// Stop accepting connections and release the listening socket.
    /// In-flight sessions keep running.
    pub fn close(&self) {
        if self.shutdown_flag.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Closing relay listener on {}", self.local_addr);
        // Not yet handed to `run`: drop it here. Otherwise `run` drops it on exit.
        drop(self.take_listener());
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No accept loop listening for close signal: {}", e);
        }
    }

    /// Wait for live sessions to finish. Returns false if `timeout` expired first.
    pub async fn wait_for_sessions(&self, timeout: Duration) -> bool {
        let start_time = Instant::now();

        while self.active_sessions() > 0 && start_time.elapsed() < timeout {
            debug!("Waiting for {} active sessions to close", self.active_sessions());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.active_sessions() == 0
    }
}
