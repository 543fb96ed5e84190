//! Parsing and validation of `exec` command lines.
//!
//! Only the two Git pack-protocol commands are ever run, and only against a
//! path below the server's working directory.  Everything else is rejected
//! before a process is spawned.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

// ---------------------------------------------------------------------------
// Allow-list
// ---------------------------------------------------------------------------

/// The two Git transport commands the server will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommand {
    /// `git-upload-pack`: serves clone and fetch.
    UploadPack,
    /// `git-receive-pack`: accepts push.
    ReceivePack,
}

impl GitCommand {
    /// Match a program name exactly as sent by the client.
    pub fn from_program(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// Program name on the wire.
    pub fn program(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// `git` subcommand that implements the program.
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

impl fmt::Display for GitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why an exec request was refused.  The `Display` text is sent to the client
/// on the channel's stderr stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("cannot parse command line: unbalanced quote or trailing backslash")]
    Unparseable,

    #[error("empty command")]
    Empty,

    #[error("command not allowed: {0:?} (only git-upload-pack and git-receive-pack are served)")]
    NotAllowed(String),

    #[error("{0} requires a repository path")]
    MissingPath(GitCommand),

    #[error("{command} takes exactly one argument, got {count}")]
    UnexpectedArguments { command: GitCommand, count: usize },

    #[error("repository path escapes the served directory: {0:?}")]
    EscapesWorkdir(String),
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A validated command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: GitCommand,
    /// Repository path, already rewritten below the working directory.
    pub repo_path: PathBuf,
}

impl Invocation {
    /// Parse an exec command line such as `git-upload-pack '/repo.git'` and
    /// resolve its repository argument below `workdir`.
    pub fn parse(command_line: &str, workdir: &Path) -> Result<Self, RejectReason> {
        // POSIX quoting, as git's SSH transport produces it.
        let words = shlex::split(command_line).ok_or(RejectReason::Unparseable)?;
        let (program, args) = words.split_first().ok_or(RejectReason::Empty)?;

        let command = GitCommand::from_program(program)
            .ok_or_else(|| RejectReason::NotAllowed(program.clone()))?;

        let repo = match args {
            [] => return Err(RejectReason::MissingPath(command)),
            [repo] => repo,
            _ => {
                return Err(RejectReason::UnexpectedArguments {
                    command,
                    count: args.len(),
                })
            }
        };

        Ok(Self {
            command,
            repo_path: resolve_repo_path(workdir, repo)?,
        })
    }
}

/// Join `requested` onto `workdir`, treating absolute paths as relative to
/// it.  The path is normalised lexically; climbing above `workdir` with `..`
/// is rejected.
pub fn resolve_repo_path(workdir: &Path, requested: &str) -> Result<PathBuf, RejectReason> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(requested).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(RejectReason::EscapesWorkdir(requested.to_string()));
                }
            }
            Component::Prefix(_) => {
                return Err(RejectReason::EscapesWorkdir(requested.to_string()));
            }
        }
    }

    let mut path = workdir.to_path_buf();
    path.extend(parts);
    Ok(path)
}
