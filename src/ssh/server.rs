//! Listener, accept loop and instance lifecycle.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::GitSshSession;
use crate::config::{validate_config, Config};
use crate::keys::{self, LOOPBACK_HOST};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Delay applied before every command spawn.  Shared between the server
/// handle and all of its connections.
#[derive(Debug, Clone, Default)]
pub struct ExecDelay(Arc<AtomicU64>);

impl ExecDelay {
    pub fn new(delay: Duration) -> Self {
        let this = Self::default();
        this.set(delay);
        this
    }

    pub fn get(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, delay: Duration) {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.0.store(nanos, Ordering::Relaxed);
    }
}

/// Per-instance settings every connection needs.
#[derive(Debug)]
pub struct ServerContext {
    pub workdir: PathBuf,
    pub git_binary: PathBuf,
    pub exec_delay: ExecDelay,
}

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

/// A running server bound to `127.0.0.1`.
///
/// The accept loop stops when [`close`](Self::close) is called or the handle
/// is dropped.  Connections already accepted keep running until their client
/// disconnects.
pub struct GitSshServer {
    port: u16,
    url: String,
    known_hosts_path: PathBuf,
    client_key_path: PathBuf,
    ctx: Arc<ServerContext>,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl GitSshServer {
    /// Serve `workdir` on an OS-assigned port with default settings.
    pub async fn start(workdir: impl Into<PathBuf>) -> Result<Self> {
        Self::start_with_config(Config::new(workdir)).await
    }

    pub async fn start_with_config(config: Config) -> Result<Self> {
        validate_config(&config)?;
        let workdir = std::fs::canonicalize(&config.workdir).with_context(|| {
            format!("failed to resolve workdir: {}", config.workdir.display())
        })?;

        let listener = TcpListener::bind((LOOPBACK_HOST, config.listen_port))
            .await
            .with_context(|| {
                format!("failed to bind SSH listener on {LOOPBACK_HOST}:{}", config.listen_port)
            })?;
        let port = listener
            .local_addr()
            .context("failed to read SSH listener address")?
            .port();

        let identities = keys::provision(&workdir, port)?;
        let russh_config = Arc::new(russh_config(identities.host_key, &config));

        let ctx = Arc::new(ServerContext {
            workdir,
            git_binary: config.git_binary.clone(),
            exec_delay: ExecDelay::new(config.exec_delay()),
        });

        let url = format!("ssh://git@{LOOPBACK_HOST}:{port}/.");
        info!(
            %url,
            workdir = %ctx.workdir.display(),
            "git SSH server listening"
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            russh_config,
            Arc::clone(&ctx),
            shutdown_rx,
        ));

        Ok(Self {
            port,
            url,
            known_hosts_path: identities.known_hosts_path,
            client_key_path: identities.client_key_path,
            ctx,
            shutdown,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `ssh://git@127.0.0.1:<port>/.`; paths below it resolve inside the
    /// working directory.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn workdir(&self) -> &Path {
        &self.ctx.workdir
    }

    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts_path
    }

    pub fn client_key_path(&self) -> &Path {
        &self.client_key_path
    }

    /// A `GIT_SSH_COMMAND` value that makes OpenSSH use this instance's
    /// client key and known-hosts file.
    pub fn git_ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o UserKnownHostsFile={} -o StrictHostKeyChecking=yes \
             -o IdentitiesOnly=yes -o BatchMode=yes",
            shell_quote(&self.client_key_path),
            shell_quote(&self.known_hosts_path),
        )
    }

    /// Delay every subsequent command spawn by `delay`.
    pub fn delay_execs(&self, delay: Duration) {
        debug!(?delay, "exec delay changed");
        self.ctx.exec_delay.set(delay);
    }

    pub fn exec_delay(&self) -> Duration {
        self.ctx.exec_delay.get()
    }

    /// Stop accepting connections and release the port.
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.accept_task
            .await
            .context("SSH accept loop panicked")?;
        info!(port = self.port, "git SSH server closed");
        Ok(())
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// russh configuration
// ---------------------------------------------------------------------------

fn russh_config(host_key: KeyPair, config: &Config) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: config.inactivity_timeout(),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

async fn accept_loop(
    listener: TcpListener,
    config: Arc<server::Config>,
    ctx: Arc<ServerContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("listener closed; accept loop exiting");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer_addr,
                        Arc::clone(&config),
                        Arc::clone(&ctx),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed; accept loop exiting");
                    return;
                }
            },
        }
    }
}

/// Run the SSH protocol on one accepted connection until the client goes
/// away.  Errors end this connection only.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<server::Config>,
    ctx: Arc<ServerContext>,
) {
    debug!(peer = %peer_addr, "accepted connection");
    let _ = stream.set_nodelay(true);

    let handler = GitSshSession::new(ctx, Some(peer_addr));
    match server::run_stream(config, stream, handler).await {
        Ok(session) => match session.await {
            Ok(()) => debug!(peer = %peer_addr, "connection closed"),
            Err(e) => warn!(peer = %peer_addr, error = %e, "SSH session ended with error"),
        },
        Err(e) => warn!(peer = %peer_addr, error = %e, "SSH handshake failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_delay_is_shared_between_clones() {
        let delay = ExecDelay::new(Duration::from_millis(250));
        let clone = delay.clone();
        assert_eq!(clone.get(), Duration::from_millis(250));

        clone.set(Duration::ZERO);
        assert_eq!(delay.get(), Duration::ZERO);

        delay.set(Duration::MAX);
        assert_eq!(clone.get(), Duration::from_nanos(u64::MAX));
    }

    #[test]
    fn paths_are_single_quoted() {
        assert_eq!(shell_quote(Path::new("/tmp/a b")), "'/tmp/a b'");
        assert_eq!(shell_quote(Path::new("/tmp/it's")), r"'/tmp/it'\''s'");
    }

    #[tokio::test]
    async fn start_exposes_url_and_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let server = GitSshServer::start(tmp.path()).await.unwrap();

        assert_ne!(server.port(), 0);
        assert_eq!(server.url(), format!("ssh://git@127.0.0.1:{}/.", server.port()));
        assert!(server.known_hosts_path().is_file());
        assert!(server.client_key_path().is_file());
        assert_eq!(server.workdir(), std::fs::canonicalize(tmp.path()).unwrap());
        assert!(server.git_ssh_command().contains("IdentitiesOnly=yes"));

        server.delay_execs(Duration::from_secs(2));
        assert_eq!(server.exec_delay(), Duration::from_secs(2));

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_refuses_new_connections() {
        let tmp = tempfile::tempdir().unwrap();
        let server = GitSshServer::start(tmp.path()).await.unwrap();
        let port = server.port();

        TcpStream::connect((LOOPBACK_HOST, port)).await.unwrap();
        server.close().await.unwrap();

        assert!(TcpStream::connect((LOOPBACK_HOST, port)).await.is_err());
    }

    #[tokio::test]
    async fn missing_workdir_fails_to_start() {
        let result = GitSshServer::start("/nonexistent/gitsshd-workdir").await;
        assert!(result.is_err());
    }
}
