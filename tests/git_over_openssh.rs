//! Clone and push through the system `git` and `ssh` clients, configured
//! only through the artifacts the server provisions.

mod common;

use std::path::Path;
use std::process::Command;

use common::{git_available, init_bare, tool_available};
use gitsshd::GitSshServer;

fn git(dir: &Path, ssh_command: &str, args: &[&str]) {
    let out = Command::new("git")
        .current_dir(dir)
        .env("GIT_SSH_COMMAND", ssh_command)
        .env("GIT_TERMINAL_PROMPT", "0")
        .args(["-c", "user.name=gitsshd", "-c", "user.email=gitsshd@localhost"])
        .args(args)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clone_push_and_clone_again() {
    if !git_available() || !tool_available("ssh", "-V") {
        eprintln!("git or ssh not installed; skipping");
        return;
    }

    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    init_bare(&remote.path().join("project.git"));

    let server = GitSshServer::start(remote.path()).await.unwrap();
    let url = format!("{}/project.git", server.url());
    let ssh = server.git_ssh_command();

    // The git processes block, so keep them off the runtime threads.
    let root = local.path().to_path_buf();
    tokio::task::spawn_blocking(move || {
        git(&root, &ssh, &["clone", "--quiet", &url, "first"]);
        let first = root.join("first");
        std::fs::write(first.join("README"), "hello over ssh\n").unwrap();
        git(&first, &ssh, &["add", "README"]);
        git(&first, &ssh, &["commit", "--quiet", "-m", "initial"]);
        git(&first, &ssh, &["push", "--quiet", "origin", "HEAD:refs/heads/main"]);

        git(&root, &ssh, &["clone", "--quiet", "--branch", "main", &url, "second"]);
        let readme = std::fs::read_to_string(root.join("second/README")).unwrap();
        assert_eq!(readme, "hello over ssh\n");
    })
    .await
    .unwrap();

    server.close().await.unwrap();
}
