// Configuration schema for the numibus substrate.
// Numan Thabit 2026

use std::{
    env, fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Socket-level knobs.
    pub socket: SocketSettings,
    /// Reverse-proxy backend pool knobs.
    pub reproxy: ReproxySettings,
    /// Peer registry knobs.
    pub peers: PeerSettings,
}

impl Config {
    /// Loads configuration from `NUMIBUS_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("NUMIBUS_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reproxy.validate().map_err(ConfigError::Validation)?;
        self.peers.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Socket-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    /// Connect timeout in milliseconds; 0 disables the timer.
    pub connect_timeout_ms: u64,
}

impl SocketSettings {
    /// Connect timeout as a [`Duration`], `None` when disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connect_timeout_ms))
        }
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 0,
        }
    }
}

/// Reverse-proxy backend pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReproxySettings {
    /// Bridges kept warm per backend.
    pub min_pool: usize,
    /// Hard cap on bridges per backend, connecting ones included.
    pub max_pool: usize,
    /// Initial learned idle timeout for bridges, in milliseconds.
    pub idle_timeout_ms: u64,
}

impl ReproxySettings {
    /// Initial idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<(), String> {
        if self.min_pool == 0 {
            return Err("reproxy.min_pool must be at least 1".into());
        }
        if self.max_pool < self.min_pool {
            return Err(format!(
                "reproxy.max_pool ({}) must be >= min_pool ({})",
                self.max_pool, self.min_pool
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err("reproxy.idle_timeout_ms must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for ReproxySettings {
    fn default() -> Self {
        Self {
            min_pool: 1,
            max_pool: 5,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Peer registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Minimum interval between cleanup sweeps, in seconds.
    pub cleanup_interval_s: u64,
    /// Inactivity window after which a disconnected peer is dead, in seconds.
    pub timeout_s: u64,
}

impl PeerSettings {
    /// Cleanup interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_s)
    }

    /// Peer inactivity timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    fn validate(&self) -> Result<(), String> {
        if self.cleanup_interval_s == 0 {
            return Err("peers.cleanup_interval_s must be non-zero".into());
        }
        if self.timeout_s == 0 {
            return Err("peers.timeout_s must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_s: 10,
            timeout_s: 15,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connect_timeout={}ms pool={}..{} idle={}ms peer_cleanup={}s",
            self.socket.connect_timeout_ms,
            self.reproxy.min_pool,
            self.reproxy.max_pool,
            self.reproxy.idle_timeout_ms,
            self.peers.cleanup_interval_s,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        cfg.validate().expect("defaults valid");
        assert_eq!(cfg.reproxy.min_pool, 1);
        assert_eq!(cfg.reproxy.max_pool, 5);
        assert_eq!(cfg.reproxy.idle_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.peers.cleanup_interval(), Duration::from_secs(10));
        assert!(cfg.socket.connect_timeout().is_none());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = Config::from_toml_str(
            r#"
            [reproxy]
            min_pool = 2
            max_pool = 8

            [socket]
            connect_timeout_ms = 2500
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.reproxy.min_pool, 2);
        assert_eq!(cfg.reproxy.max_pool, 8);
        assert_eq!(
            cfg.socket.connect_timeout(),
            Some(Duration::from_millis(2500))
        );
        // Untouched sections keep their defaults.
        assert_eq!(cfg.peers.timeout_s, 15);
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = Config::from_toml_str(
            r#"
            [reproxy]
            min_pool = 6
            max_pool = 2
            "#,
        )
        .expect_err("must fail validation");
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[peers]\ntimeout_s = 30").expect("write");
        let cfg = Config::from_path(file.path()).expect("load");
        assert_eq!(cfg.peers.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn from_reader_parses() {
        let cfg = Config::from_reader("[reproxy]\nmax_pool = 9\n".as_bytes()).expect("reader");
        assert_eq!(cfg.reproxy.max_pool, 9);
    }
}
