//! Loopback SSH server that lets real Git clients clone, fetch and push
//! against a local working directory.
//!
//! [`GitSshServer::start`] binds an ephemeral port on `127.0.0.1`, writes a
//! `known_hosts` file and a client private key into the working directory, and
//! serves `git-upload-pack` / `git-receive-pack` exec requests by running the
//! system `git` binary against paths below that directory.  Any client key is
//! accepted.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let server = gitsshd::GitSshServer::start("/tmp/remote.git").await?;
//! println!("clone from {}", server.url());
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod keys;
pub mod ssh;

pub use config::{load_config, Config};
pub use ssh::command::{GitCommand, RejectReason};
pub use ssh::server::GitSshServer;
