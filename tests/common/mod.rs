#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use gitsshd::GitSshServer;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

/// Accepts the server only if it presents the expected key.
pub struct PinnedHostKey {
    expected: String,
}

#[async_trait]
impl client::Handler for PinnedHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(server_public_key.public_key_base64() == self.expected)
    }
}

/// Base64 key blob from a one-line known-hosts file.
pub fn known_host_key(path: &Path) -> String {
    let line = std::fs::read_to_string(path).unwrap();
    line.split_whitespace().nth(2).unwrap().to_string()
}

pub async fn connect(server: &GitSshServer) -> Result<client::Handle<PinnedHostKey>, russh::Error> {
    connect_expecting(server, known_host_key(server.known_hosts_path())).await
}

pub async fn connect_expecting(
    server: &GitSshServer,
    expected: String,
) -> Result<client::Handle<PinnedHostKey>, russh::Error> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(
        config,
        ("127.0.0.1", server.port()),
        PinnedHostKey { expected },
    )
    .await?;

    let key = russh_keys::load_secret_key(server.client_key_path(), None).unwrap();
    let authenticated = handle.authenticate_publickey("git", Arc::new(key)).await?;
    assert!(authenticated, "server rejected the provisioned client key");
    Ok(handle)
}

/// Everything a channel delivered until it was closed.
#[derive(Debug, Default)]
pub struct Transcript {
    /// Replies to channel requests, `true` for success.
    pub replies: Vec<bool>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl Transcript {
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub async fn drain(channel: &mut Channel<Msg>) -> Transcript {
    let mut transcript = Transcript::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => transcript.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => transcript.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => transcript.exit_status = Some(exit_status),
            ChannelMsg::Success => transcript.replies.push(true),
            ChannelMsg::Failure => transcript.replies.push(false),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    transcript
}

/// Wait for the reply to a request sent with `want_reply`.
pub async fn next_reply(channel: &mut Channel<Msg>) -> bool {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return true,
            Some(ChannelMsg::Failure) => return false,
            Some(ChannelMsg::Close) | None => panic!("channel closed before replying"),
            Some(_) => {}
        }
    }
}

/// A `git` stand-in running `body` under `/bin/sh`.
#[cfg(unix)]
pub fn fake_git(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-git");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn tool_available(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn git_available() -> bool {
    tool_available("git", "--version")
}

/// `git init --bare <path>`.
pub fn init_bare(path: &Path) {
    let status = Command::new("git")
        .args(["init", "--quiet", "--bare"])
        .arg(path)
        .status()
        .unwrap();
    assert!(status.success(), "git init --bare failed");
}
