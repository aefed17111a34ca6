use super::connection::{ConnectionOutcome, ConnectionReport, handle_connection};
use super::sink::RecordSink;
use crate::error::Result;
use log::{debug, info, warn};
use procwatch_shared::ShutdownRequest;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

/// Time left to in-flight connections once shutdown was requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub connections: u64,
    pub records: u64,
    pub protocol_errors: u64,
}

impl CollectorStats {
    fn collect(&mut self, joined: std::result::Result<ConnectionReport, JoinError>) {
        match joined {
            Ok(report) => {
                debug!(
                    "Connection from {} done, {} records",
                    report.peer, report.records
                );
                self.records += report.records;
                if report.outcome.is_err() {
                    self.protocol_errors += 1;
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Connection task failed: {e}"),
        }
    }
}

/// Receives framed records over TCP and writes them to a single sink.
pub struct CollectorServer {
    listener: TcpListener,
    sink: Arc<dyn RecordSink>,
}

impl CollectorServer {
    pub async fn bind(addr: SocketAddr, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        // a collector restarted right after a previous one must not wait for TIME_WAIT
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(1024)?;

        info!("Log collector listening on {}", listener.local_addr()?);
        Ok(Self { listener, sink })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a client sends the shutdown sentinel.
    ///
    /// Each connection runs in its own task. Once shutdown is requested the listener is closed,
    /// remaining connections get [`SHUTDOWN_GRACE`] to finish, then the sink is flushed.
    pub async fn serve(self) -> Result<CollectorStats> {
        let Self { listener, sink } = self;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(None::<ShutdownRequest>);
        let mut connections = JoinSet::new();
        let mut stats = CollectorStats::default();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {peer}");
                        stats.connections += 1;
                        let sink = Arc::clone(&sink);
                        let shutdown_tx = shutdown_tx.clone();
                        connections.spawn(async move {
                            let report = handle_connection(stream, peer, sink).await;
                            if let Ok(ConnectionOutcome::ShutdownRequested(request)) =
                                &report.outcome
                            {
                                shutdown_tx.send_replace(Some(request.clone()));
                            }
                            report
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    stats.collect(joined);
                }
                Ok(()) = shutdown_rx.changed() => break,
            }
        }

        drop(listener);
        if let Some(request) = shutdown_rx.borrow().as_ref() {
            info!(
                "Log collector shutting down on request of {} (pid {})",
                request.requester, request.pid
            );
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = connections.join_next().await {
                stats.collect(joined);
            }
        })
        .await;
        if drained.is_err() {
            debug!(
                "Closing {} connections still open after shutdown",
                connections.len()
            );
            connections.abort_all();
            while let Some(joined) = connections.join_next().await {
                stats.collect(joined);
            }
        }

        sink.flush()?;
        info!(
            "Log collector stopped: {} connections, {} records, {} protocol errors",
            stats.connections, stats.records, stats.protocol_errors
        );
        Ok(stats)
    }
}
