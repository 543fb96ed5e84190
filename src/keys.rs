//! Ephemeral key material for one server instance.
//!
//! Each instance generates two Ed25519 keypairs: the SSH host key, whose
//! public half is published as a `known_hosts` line, and a client key written
//! as an OpenSSH private-key file that test clients can load directly.  The
//! server accepts any client key, so the client key only exists to give
//! clients something to present.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand_core::OsRng;
use russh_keys::key::KeyPair;
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tracing::debug;

/// File name of the known-hosts artifact inside the working directory.
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";
/// File name of the client private key inside the working directory.
pub const CLIENT_KEY_FILE: &str = "id_ed25519";
/// Address the server binds and advertises.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Key material and artifact paths produced by [`provision`].
pub struct Identities {
    /// Host key handed to the SSH transport.
    pub host_key: KeyPair,
    pub known_hosts_path: PathBuf,
    pub client_key_path: PathBuf,
}

/// Generate the host and client keypairs for a server listening on `port`
/// and write the `known_hosts` and `id_ed25519` artifacts into `workdir`.
pub fn provision(workdir: &Path, port: u16) -> Result<Identities> {
    let host = generate_ed25519().context("failed to generate SSH host key")?;
    let client = generate_ed25519().context("failed to generate SSH client key")?;

    let known_hosts_path = workdir.join(KNOWN_HOSTS_FILE);
    let line = known_hosts_line(host.public_key(), port)?;
    write_with_mode(&known_hosts_path, line.as_bytes(), 0o644)?;

    let client_key_path = workdir.join(CLIENT_KEY_FILE);
    let client_pem = client
        .to_openssh(LineEnding::LF)
        .context("failed to encode client key")?;
    write_with_mode(&client_key_path, client_pem.as_bytes(), 0o600)?;

    let host_pem = host
        .to_openssh(LineEnding::LF)
        .context("failed to encode host key")?;
    let host_key = russh_keys::decode_secret_key(&host_pem, None)
        .context("failed to load host key into the SSH transport")?;

    debug!(
        known_hosts = %known_hosts_path.display(),
        client_key = %client_key_path.display(),
        "provisioned ephemeral SSH identities"
    );

    Ok(Identities {
        host_key,
        known_hosts_path,
        client_key_path,
    })
}

fn generate_ed25519() -> Result<PrivateKey> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).context("random key generation failed")
}

/// Render the known-hosts line for `key`.
///
/// The loopback address is listed both bare and in the `[host]:port` form
/// OpenSSH uses when looking up non-standard ports.
pub fn known_hosts_line(key: &PublicKey, port: u16) -> Result<String> {
    let encoded = key
        .to_openssh()
        .context("failed to encode host public key")?;
    Ok(format!("{LOOPBACK_HOST},[{LOOPBACK_HOST}]:{port} {encoded}\n"))
}

#[cfg_attr(not(unix), allow(unused_variables))]
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;

    // `mode` only applies when the file is created.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}
