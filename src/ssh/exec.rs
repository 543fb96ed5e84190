//! Running an allowed Git command on a session channel.
//!
//! The child's three standard streams are each pumped by their own task:
//! channel data feeds stdin, stdout becomes channel data and stderr becomes
//! extended data (stream 1).  The exec request is acknowledged once the
//! process has started; `exit-status` follows after it has exited and its
//! output has been flushed to the channel.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelEvent, ChannelSink, ExecRequest};
use super::command::{Invocation, RejectReason};
use super::server::ServerContext;

const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Server variables passed through to git.  Everything else the child sees
/// comes from the client's `env` requests.
const INHERITED_ENV: &[&str] = &["PATH"];

/// Result of handling one `exec` request.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Refused before anything was spawned.
    Rejected(RejectReason),
    /// The process could not be started.
    SpawnFailed,
    /// The process exited; carries the status sent to the client.
    Exited(u32),
    /// Waiting for the process failed; no exit status was sent.
    WaitFailed,
}

/// Validate and run `request` with the channel's accumulated `env`.
///
/// `events` carries the rest of the channel's traffic; while the command runs
/// its data is written to the child's stdin.  The channel is closed before
/// this returns, whatever the outcome.
pub async fn execute<S: ChannelSink>(
    sink: &S,
    ctx: &ServerContext,
    env: &[(String, String)],
    request: ExecRequest,
    events: UnboundedReceiver<ChannelEvent>,
) -> ExecOutcome {
    let command_line = String::from_utf8_lossy(&request.command_line).into_owned();

    let invocation = match Invocation::parse(&command_line, &ctx.workdir) {
        Ok(invocation) => invocation,
        Err(reason) => {
            warn!(command = %command_line, %reason, "rejected exec request");
            sink.failure().await;
            sink.stderr(format!("ERROR: {reason}\n").as_bytes()).await;
            sink.close().await;
            return ExecOutcome::Rejected(reason);
        }
    };

    let delay = ctx.exec_delay.get();
    if !delay.is_zero() {
        debug!(?delay, "delaying exec");
        tokio::time::sleep(delay).await;
    }

    let mut cmd = Command::new(&ctx.git_binary);
    cmd.arg(invocation.command.subcommand())
        .arg(&invocation.repo_path)
        .env_clear();
    for name in INHERITED_ENV {
        if let Some(value) = std::env::var_os(name) {
            cmd.env(name, value);
        }
    }
    for (name, value) in env {
        cmd.env(name, value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(
                command = %invocation.command,
                git = %ctx.git_binary.display(),
                error = %e,
                "failed to spawn git"
            );
            sink.failure().await;
            sink.stderr(format!("ERROR: failed to start {}: {e}\n", invocation.command).as_bytes())
                .await;
            sink.close().await;
            return ExecOutcome::SpawnFailed;
        }
    };

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        error!("spawned git without piped stdio");
        let _ = child.start_kill();
        sink.failure().await;
        sink.close().await;
        return ExecOutcome::SpawnFailed;
    };

    info!(
        command = %invocation.command,
        repo = %invocation.repo_path.display(),
        pid = ?child.id(),
        "started git"
    );
    sink.success().await;

    let stdin_task = tokio::spawn(feed_stdin(stdin, events));
    let stdout_task = tokio::spawn(forward_output(stdout, sink.clone(), OutputStream::Stdout));
    let stderr_task = tokio::spawn(forward_output(stderr, sink.clone(), OutputStream::Stderr));

    let status = child.wait().await;

    // All output has to be on the channel before exit-status.
    let _ = tokio::join!(stdout_task, stderr_task);
    stdin_task.abort();

    let outcome = match status {
        Ok(status) => {
            let code = exit_code(status);
            info!(command = %invocation.command, exit_status = code, "git exited");
            sink.exit_status(code).await;
            ExecOutcome::Exited(code)
        }
        Err(e) => {
            error!(command = %invocation.command, error = %e, "failed to wait for git");
            ExecOutcome::WaitFailed
        }
    };

    sink.close().await;
    outcome
}

/// Exit status reported to the client.  A process killed by signal `N`
/// reports `128 + N`, as shells do.
pub fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    1
}

// ---------------------------------------------------------------------------
// Stream pumps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn forward_output<R, S>(mut reader: R, sink: S, stream: OutputStream)
where
    R: AsyncRead + Unpin,
    S: ChannelSink,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "error reading git output");
                break;
            }
        };
        let delivered = match stream {
            OutputStream::Stdout => sink.data(&buf[..n]).await,
            OutputStream::Stderr => sink.stderr(&buf[..n]).await,
        };
        if !delivered {
            debug!(?stream, "channel closed while forwarding git output");
            break;
        }
    }
}

/// Write channel data to the child until the client sends EOF, then keep
/// draining the queue until the command exits.
///
/// A further `exec` is dropped without a reply.  russh tracks one pending
/// reply per channel, so an answer to it could be taken for the answer to
/// the running command.
async fn feed_stdin(stdin: ChildStdin, mut events: UnboundedReceiver<ChannelEvent>) {
    let mut stdin = Some(stdin);
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(bytes) => {
                let Some(pipe) = stdin.as_mut() else {
                    debug!(len = bytes.len(), "discarding data after stdin closed");
                    continue;
                };
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, "failed to write to git stdin (process may have exited)");
                    stdin = None;
                }
            }
            ChannelEvent::Eof => {
                // Dropping the handle closes the pipe.
                stdin = None;
            }
            ChannelEvent::Exec(request) => {
                warn!(
                    command = %String::from_utf8_lossy(&request.command_line),
                    "ignoring second exec request on channel"
                );
            }
            ChannelEvent::Env(_) => debug!("ignoring env request after exec"),
            ChannelEvent::Unsupported(kind) => {
                warn!(request = kind, "ignoring channel request while git is running");
            }
        }
    }
}
