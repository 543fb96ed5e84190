//! Per-channel request dispatch.
//!
//! The connection handler turns every request and data packet for a session
//! channel into a [`ChannelEvent`] and queues it for that channel's
//! dispatcher task.  The dispatcher processes events strictly in order:
//!
//! ```text
//! Opening -> EnvAccumulating (env)* -> Executing -> Closed
//! ```
//!
//! Anything other than `env` or `exec` before the command starts closes the
//! channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::exec::{self, ExecOutcome};
use super::server::ServerContext;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Payload of an `env` channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub name: String,
    pub value: String,
}

/// Payload of an `exec` channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command_line: Vec<u8>,
}

/// Something the client sent on a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Env(EnvRequest),
    Exec(ExecRequest),
    Data(Vec<u8>),
    Eof,
    /// A channel request type the server does not serve (`shell`, ...).
    Unsupported(&'static str),
}

// ---------------------------------------------------------------------------
// Outbound side
// ---------------------------------------------------------------------------

/// Outbound half of a session channel.
///
/// Replies and output go through this trait so the dispatcher does not depend
/// on a live SSH session.
#[async_trait]
pub trait ChannelSink: Clone + Send + Sync + 'static {
    /// Positive reply to the pending channel request.
    async fn success(&self);
    /// Negative reply to the pending channel request.
    async fn failure(&self);
    /// Send channel data.  Returns `false` once the channel is gone.
    async fn data(&self, bytes: &[u8]) -> bool;
    /// Send extended data on the stderr stream.  Returns `false` once the
    /// channel is gone.
    async fn stderr(&self, bytes: &[u8]) -> bool;
    /// Send an `exit-status` request.
    async fn exit_status(&self, code: u32);
    /// Send EOF and close the channel.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// How a channel's dispatcher finished.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// An `exec` request was handled.
    Exec(ExecOutcome),
    /// An unsupported request type closed the channel.
    Illegal(&'static str),
    /// The client went away before sending `exec`.
    Abandoned,
}

/// Process the requests of one session channel until its `exec` request has
/// been handled or the channel is closed.
pub async fn dispatch<S: ChannelSink>(
    sink: S,
    ctx: Arc<ServerContext>,
    mut events: UnboundedReceiver<ChannelEvent>,
) -> ChannelOutcome {
    let mut env: Vec<(String, String)> = Vec::new();

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Env(EnvRequest { name, value }) => {
                debug!(%name, %value, "env request");
                env.push((name, value));
            }
            ChannelEvent::Exec(request) => {
                let outcome = exec::execute(&sink, &ctx, &env, request, events).await;
                return ChannelOutcome::Exec(outcome);
            }
            ChannelEvent::Data(bytes) => {
                debug!(len = bytes.len(), "discarding data received before exec");
            }
            ChannelEvent::Eof => debug!("EOF received before exec"),
            ChannelEvent::Unsupported(kind) => {
                warn!(request = kind, "illegal channel request; closing channel");
                sink.close().await;
                return ChannelOutcome::Illegal(kind);
            }
        }
    }

    ChannelOutcome::Abandoned
}
