//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, stops the listener, and gives in-flight
//! sessions a bounded amount of time to finish.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use crate::connection::RelayListener;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Wait for a shutdown signal (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Close the listener and wait for its sessions to drain
    pub async fn shutdown_listener(&self, listener: &RelayListener) -> Result<()> {
        info!("Initiating graceful shutdown of relay listener");
        let start_time = Instant::now();

        listener.close();

        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            listener.active_sessions(),
            self.timeout
        );

        if listener.wait_for_sessions(self.timeout).await {
            info!("All sessions closed gracefully in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start_time.elapsed(),
                listener.active_sessions()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{PeerDialer, RelayContext, Rewrite, RoleResolver};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn idle_listener() -> Arc<RelayListener> {
        let resolver = RoleResolver::new("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap());
        let dialer = PeerDialer::new(resolver.clone(), 7001, None, Duration::from_secs(1));
        let context = RelayContext::new(resolver, dialer, Rewrite::server_ip(Ipv4Addr::LOCALHOST).unwrap());
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        Arc::new(
            RelayListener::bind_with_context(addr, Arc::new(context), None)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_shutdown_listener_closes_and_drains() {
        let listener = idle_listener().await;
        let addr = listener.local_addr().unwrap();
        let runner = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run().await })
        };

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        timeout(Duration::from_secs(2), coordinator.shutdown_listener(&listener))
            .await
            .expect("drain with no sessions should finish at once")
            .unwrap();

        assert!(listener.is_closed());
        assert_eq!(listener.active_sessions(), 0);
        runner.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_sessions() {
        let listener = idle_listener().await;
        let addr = listener.local_addr().unwrap();
        let runner = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run().await })
        };

        // 127.0.0.1 is not a configured peer, so its session ends on its own
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), tokio::io::AsyncReadExt::read(&mut client, &mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        coordinator.shutdown_listener(&listener).await.unwrap();

        assert_eq!(listener.active_sessions(), 0);
        assert_eq!(listener.total_sessions(), 1);
        runner.await.unwrap().unwrap();
    }
}
