use super::server::{CollectorServer, CollectorStats};
use super::sink::FileSink;
use crate::config::CollectorSettings;
use crate::prelude::*;
use crate::process::{self, KillOptions, Launcher};
use std::ffi::OsStr;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// CLI subcommand running a collector in the foreground.
pub const SERVE_SUBCOMMAND: &str = "serve";
/// How long a freshly spawned collector has to accept connections.
pub const COLLECTOR_SPAWN_TIMEOUT: Duration = Duration::from_secs(4);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn collector_addr(port: u16) -> SocketAddr {
    (Ipv4Addr::LOCALHOST, port).into()
}

/// Whether nothing listens on `port` on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(collector_addr(port)).is_ok()
}

/// Run a collector on `port` until a client requests its shutdown.
pub async fn run_collector(port: u16, log_file: &Path) -> Result<CollectorStats> {
    let sink = FileSink::create(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;
    let server = CollectorServer::bind(collector_addr(port), Arc::new(sink))
        .await
        .with_context(|| format!("Failed to listen on port {port}"))?;

    Ok(server.serve().await?)
}

/// Start a collector in its own process and wait until it accepts connections.
///
/// Returns the PID of the collector, to be stopped with
/// [`crate::client::CollectorHandler::request_shutdown`].
pub fn spawn_collector(launcher: &Launcher, settings: &CollectorSettings) -> Result<u32> {
    let port = settings.port;
    ensure!(is_port_free(port), "Port {port} is already in use");

    let port_arg = port.to_string();
    let pid = launcher
        .spawn([
            OsStr::new(SERVE_SUBCOMMAND),
            OsStr::new("--port"),
            OsStr::new(&port_arg),
            OsStr::new("--log-file"),
            settings.log_file.as_os_str(),
        ])
        .context("Failed to spawn the log collector")?;
    debug!("Log collector spawned with pid {pid}, waiting for port {port}");

    let addr = collector_addr(port);
    let deadline = Instant::now() + COLLECTOR_SPAWN_TIMEOUT;
    while Instant::now() < deadline {
        if TcpStream::connect_timeout(&addr, READY_POLL_INTERVAL).is_ok() {
            info!("Log collector {pid} ready on {addr}");
            return Ok(pid);
        }
        if !process::exists(pid)? {
            bail!("Log collector {pid} exited before listening on {addr}");
        }
        thread::sleep(READY_POLL_INTERVAL);
    }

    process::kill_tree(pid, KillOptions::no_raise())?;
    bail!(
        "Log collector {pid} did not listen on {addr} within {:?}",
        COLLECTOR_SPAWN_TIMEOUT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_not_free() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_free(port));
        drop(listener);
        assert!(is_port_free(port));
    }

    #[test]
    fn test_spawn_refuses_busy_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let settings = CollectorSettings {
            port: listener.local_addr().unwrap().port(),
            ..Default::default()
        };

        let err = spawn_collector(&Launcher::new("/nonexistent/procwatch"), &settings).unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let settings = CollectorSettings {
            port,
            ..Default::default()
        };

        assert!(spawn_collector(&Launcher::new("/nonexistent/procwatch"), &settings).is_err());
    }
}
