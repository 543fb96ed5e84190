use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Settings for one [`GitSshServer`](crate::GitSshServer) instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory served to clients.  Repository paths in exec requests are
    /// resolved below it, and the `known_hosts` / `id_ed25519` artifacts are
    /// written into it.
    pub workdir: PathBuf,
    /// Loopback port to listen on.  `0` lets the OS pick one.
    #[serde(default)]
    pub listen_port: u16,
    /// Initial delay (milliseconds) applied before every command is spawned.
    #[serde(default)]
    pub exec_delay_ms: u64,
    /// Idle connections are dropped after this many seconds.  `0` disables the
    /// timeout.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// `git` executable used to run `upload-pack` / `receive-pack`.
    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,
}

fn default_inactivity_timeout_secs() -> u64 {
    600
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

impl Config {
    /// Defaults for serving `workdir` on an OS-assigned port.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            listen_port: 0,
            exec_delay_ms: 0,
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            git_binary: default_git_binary(),
        }
    }

    pub fn exec_delay(&self) -> Duration {
        Duration::from_millis(self.exec_delay_ms)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = read_config(path)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a YAML config file without validating it, for callers that still
/// apply overrides.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Checks that cannot be expressed with serde alone.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.workdir.is_dir(),
        "workdir does not exist or is not a directory: {}",
        config.workdir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, format!("workdir: {}\n", tmp.path().display())).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.workdir, tmp.path());
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.exec_delay(), Duration::ZERO);
        assert_eq!(config.inactivity_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.git_binary, Path::new("git"));
    }

    #[test]
    fn explicit_values_are_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        let yaml = format!(
            "workdir: {}\nlisten_port: 2222\nexec_delay_ms: 1500\ninactivity_timeout_secs: 0\ngit_binary: /opt/git/bin/git\n",
            tmp.path().display()
        );
        std::fs::write(&path, yaml).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.listen_port, 2222);
        assert_eq!(config.exec_delay(), Duration::from_millis(1500));
        assert_eq!(config.inactivity_timeout(), None);
        assert_eq!(config.git_binary, Path::new("/opt/git/bin/git"));
    }

    #[test]
    fn missing_workdir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "workdir: /nonexistent/gitsshd/workdir\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("workdir"));
    }

    #[test]
    fn read_config_skips_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "workdir: /nonexistent/gitsshd/workdir\n").unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.workdir, Path::new("/nonexistent/gitsshd/workdir"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = load_config("/nonexistent/gitsshd.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gitsshd.yaml"));
    }
}
