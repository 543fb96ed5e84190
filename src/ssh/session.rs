//! SSH connection handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound connection is served by a dedicated [`GitSshSession`].  Every
//! public key is accepted.  Session channels get their own dispatcher task
//! (see [`super::channel`]); the handler only routes channel requests and
//! data into that task's queue.  Other channel types and connection-level
//! requests such as `tcpip-forward` are refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use super::channel::{self, ChannelEvent, ChannelSink, EnvRequest, ExecRequest};
use super::server::ServerContext;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct GitSshSession {
    ctx: Arc<ServerContext>,
    peer_addr: Option<SocketAddr>,
    /// Event queues of the open session channels.
    channels: HashMap<ChannelId, UnboundedSender<ChannelEvent>>,
}

impl GitSshSession {
    pub fn new(ctx: Arc<ServerContext>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer_addr,
            channels: HashMap::new(),
        }
    }

    fn forward(&mut self, channel: ChannelId, event: ChannelEvent) {
        let Some(queue) = self.channels.get(&channel) else {
            debug!(?channel, "request for a channel without dispatcher");
            return;
        };
        if queue.send(event).is_err() {
            debug!(?channel, "channel dispatcher already finished");
            self.channels.remove(&channel);
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound channel half
// ---------------------------------------------------------------------------

/// [`ChannelSink`] backed by a live session handle.
#[derive(Clone)]
pub struct SessionChannel {
    handle: Handle,
    id: ChannelId,
}

#[async_trait]
impl ChannelSink for SessionChannel {
    async fn success(&self) {
        if self.handle.channel_success(self.id).await.is_err() {
            debug!(channel = ?self.id, "could not send channel success");
        }
    }

    async fn failure(&self) {
        if self.handle.channel_failure(self.id).await.is_err() {
            debug!(channel = ?self.id, "could not send channel failure");
        }
    }

    async fn data(&self, bytes: &[u8]) -> bool {
        self.handle
            .data(self.id, CryptoVec::from_slice(bytes))
            .await
            .is_ok()
    }

    async fn stderr(&self, bytes: &[u8]) -> bool {
        self.handle
            .extended_data(self.id, 1, CryptoVec::from_slice(bytes))
            .await
            .is_ok()
    }

    async fn exit_status(&self, code: u32) {
        if self.handle.exit_status_request(self.id, code).await.is_err() {
            debug!(channel = ?self.id, "could not send exit-status");
        }
    }

    /// EOF then close, in the order git's SSH transport expects.
    async fn close(&self) {
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// `SHA256:<base64>` fingerprint of an SSH public key, matching the format of
/// `ssh-keygen -l`.
fn fingerprint_of(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for GitSshSession {
    type Error = anyhow::Error;

    /// Any key is authorized.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fingerprint_of(key),
            "accepting public key"
        );
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let (queue, events) = mpsc::unbounded_channel();
        self.channels.insert(id, queue);

        let sink = SessionChannel {
            handle: session.handle(),
            id,
        };
        let ctx = Arc::clone(&self.ctx);
        let peer = self.peer_addr;
        tokio::spawn(async move {
            let outcome = channel::dispatch(sink, ctx, events).await;
            debug!(peer = ?peer, channel = ?id, ?outcome, "channel finished");
        });

        debug!(peer = ?self.peer_addr, channel = ?id, "session channel opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.peer_addr,
            channel = ?channel.id(),
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "rejecting direct-tcpip channel; only session channels are allowed"
        );
        Ok(false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::Env(EnvRequest {
                name: variable_name.to_string(),
                value: variable_value.to_string(),
            }),
        );
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            peer = ?self.peer_addr,
            channel = ?channel,
            command = %String::from_utf8_lossy(data),
            "exec request"
        );
        self.forward(
            channel,
            ChannelEvent::Exec(ExecRequest {
                command_line: data.to_vec(),
            }),
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Unsupported("shell"));
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, subsystem = %name, "subsystem request");
        self.forward(channel, ChannelEvent::Unsupported("subsystem"));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Unsupported("pty-req"));
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Data(data.to_vec()));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the queue ends a dispatcher still waiting for requests.
        self.channels.remove(&channel);
        Ok(())
    }
}
