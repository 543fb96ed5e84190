//! SSH side of the server.
//!
//! Accepts connections on a loopback listener, authenticates every client key,
//! and runs one dispatcher task per session channel.  A channel collects `env`
//! requests until an `exec` request arrives, which is validated against the
//! Git command allow-list and run as a `git` subprocess wired to the channel.

pub mod channel;
pub mod command;
pub mod exec;
pub mod server;
pub mod session;

pub use server::GitSshServer;
