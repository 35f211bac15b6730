//! Replication configuration: transfer tuning plus per-role sections,
//! loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use stripeline_transport::tcp::PortRange;

use crate::error::{ReplError, Result};
use crate::stripe::{ALGORITHM_LATEST, MAX_INTERLEAVE, MAX_SYNC_STRIPE_SIZE};

/// Largest division count accepted from configuration or a peer.
pub const MAX_DIVISIONS: usize = 1000;

/// Network and disk tuning for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Requested number of parallel data connections (default: 1).
    pub divisions: usize,
    /// Bytes per division per stripe; 0 selects contiguous division (default: 0).
    pub interleave: u64,
    /// Sender waits for every division at each stripe boundary (default: false).
    pub send_stripe_sync: bool,
    /// Receiver waits for every division at each stripe boundary (default: false).
    pub recv_stripe_sync: bool,
    /// Bytes per local read on the sending side (default: 4096).
    pub file_read_size: usize,
    /// Per-division send rate in bits per second; 0 is unlimited (default: 0).
    pub rate_limit_bps: u64,
    /// Sync the replica every this many written bytes; 0 disables (default: 0).
    pub sync_rate_bytes: u64,
    /// Sync the replica every this many completed stripes; 0 disables (default: 0).
    pub file_sync_stripe: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            divisions: 1,
            interleave: 0,
            send_stripe_sync: false,
            recv_stripe_sync: false,
            file_read_size: 4096,
            rate_limit_bps: 0,
            sync_rate_bytes: 0,
            file_sync_stripe: 0,
        }
    }
}

impl TransferConfig {
    /// Rejects combinations no transfer variant can run.
    pub fn validate(&self) -> Result<()> {
        if self.divisions == 0 || self.divisions > MAX_DIVISIONS {
            return Err(ReplError::InvalidConfig {
                msg: format!(
                    "divisions must be within 1..={}, got {}",
                    MAX_DIVISIONS, self.divisions
                ),
            });
        }
        if self.interleave == 0 && (self.send_stripe_sync || self.recv_stripe_sync) {
            return Err(ReplError::InvalidConfig {
                msg: "stripe synchronization needs a non-zero interleave factor".into(),
            });
        }
        if self.interleave > MAX_INTERLEAVE {
            return Err(ReplError::InvalidConfig {
                msg: format!(
                    "interleave must be at most {}, got {}",
                    MAX_INTERLEAVE, self.interleave
                ),
            });
        }
        let stripe = self.interleave * self.divisions as u64;
        if (self.send_stripe_sync || self.recv_stripe_sync) && stripe > MAX_SYNC_STRIPE_SIZE {
            return Err(ReplError::InvalidConfig {
                msg: format!("stripe of {} bytes is too large for stripe synchronization", stripe),
            });
        }
        if self.file_read_size == 0 {
            return Err(ReplError::InvalidConfig {
                msg: "file_read_size must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Source-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control listener address (default: 0.0.0.0:11600).
    pub listen: String,
    /// Directory replicas are read from (default: /var/spool/stripeline).
    pub spool_root: PathBuf,
    /// Striping algorithm version the server runs (default: 0).
    pub algorithm_version: i32,
    /// Upper bound on divisions a client may request (default: 1000).
    pub max_divisions: usize,
    /// Identity presented when connecting back to a destination
    /// (default: $USER or "stripeline").
    pub identity: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:11600".into(),
            spool_root: PathBuf::from("/var/spool/stripeline"),
            algorithm_version: ALGORITHM_LATEST,
            max_divisions: MAX_DIVISIONS,
            identity: std::env::var("USER").unwrap_or_else(|_| "stripeline".into()),
        }
    }
}

/// Destination-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory replicas are written to (default: /var/spool/stripeline).
    pub spool_root: PathBuf,
    /// Local identity; replicas owned by someone else get widened modes
    /// (default: $USER or "stripeline").
    pub identity: String,
    /// First port tried for the data listener (default: 11000).
    pub port_min: u16,
    /// Last port tried for the data listener (default: 12000).
    pub port_max: u16,
    /// TCP connect timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            spool_root: PathBuf::from("/var/spool/stripeline"),
            identity: std::env::var("USER").unwrap_or_else(|_| "stripeline".into()),
            port_min: 11000,
            port_max: 12000,
            connect_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    /// Port range for the data listener.
    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_min, self.port_max)
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// File holding the shared secret; without one peers are trusted.
    pub shared_secret_file: Option<PathBuf>,
}

impl AuthConfig {
    /// Reads the shared secret, if one is configured. Surrounding whitespace
    /// is not part of the secret.
    pub fn load_secret(&self) -> std::io::Result<Option<Vec<u8>>> {
        match &self.shared_secret_file {
            Some(path) => {
                let raw = std::fs::read(path)?;
                Ok(Some(raw.trim_ascii().to_vec()))
            }
            None => Ok(None),
        }
    }
}

/// Complete replication configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Transfer tuning.
    pub transfer: TransferConfig,
    /// Source-side settings.
    pub server: ServerConfig,
    /// Destination-side settings.
    pub client: ClientConfig,
    /// Authentication settings.
    pub auth: AuthConfig,
}

impl ReplConfig {
    /// Loads a `.toml` or `.json` configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ReplConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ReplConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        if self.client.port_min > self.client.port_max {
            return Err(ReplError::InvalidConfig {
                msg: format!(
                    "empty port range {}..={}",
                    self.client.port_min, self.client.port_max
                ),
            });
        }
        if self.server.max_divisions == 0 {
            return Err(ReplError::InvalidConfig {
                msg: "max_divisions must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ReplConfig::default();
        assert_eq!(config.transfer.divisions, 1);
        assert_eq!(config.transfer.interleave, 0);
        assert_eq!(config.transfer.file_read_size, 4096);
        assert_eq!(config.transfer.rate_limit_bps, 0);
        assert_eq!(config.client.port_range(), PortRange::new(11000, 12000));
        assert_eq!(config.server.algorithm_version, ALGORITHM_LATEST);
        assert!(config.auth.shared_secret_file.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[transfer]
divisions = 4
interleave = 65536
recv_stripe_sync = true
file_sync_stripe = 10

[client]
spool_root = "/srv/replicas"
port_min = 0
port_max = 0
"#
        )
        .unwrap();
        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transfer.divisions, 4);
        assert_eq!(config.transfer.interleave, 65536);
        assert!(config.transfer.recv_stripe_sync);
        assert_eq!(config.transfer.file_sync_stripe, 10);
        assert_eq!(config.transfer.file_read_size, 4096);
        assert_eq!(config.client.spool_root, PathBuf::from("/srv/replicas"));
        assert!(config.client.port_range().is_ephemeral());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"server": {{"listen": "127.0.0.1:9000"}}}}"#).unwrap();
        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(ReplConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_stripe_sync_needs_interleave() {
        let transfer = TransferConfig {
            recv_stripe_sync: true,
            ..TransferConfig::default()
        };
        assert!(matches!(transfer.validate(), Err(ReplError::InvalidConfig { .. })));
        let transfer = TransferConfig {
            divisions: 0,
            ..TransferConfig::default()
        };
        assert!(transfer.validate().is_err());
    }

    #[test]
    fn test_interleave_caps() {
        let transfer = TransferConfig {
            interleave: MAX_INTERLEAVE + 1,
            ..TransferConfig::default()
        };
        assert!(matches!(transfer.validate(), Err(ReplError::InvalidConfig { .. })));
        let transfer = TransferConfig {
            divisions: 8,
            interleave: MAX_INTERLEAVE,
            ..TransferConfig::default()
        };
        assert!(transfer.validate().is_ok());
        let transfer = TransferConfig {
            send_stripe_sync: true,
            ..transfer
        };
        assert!(transfer.validate().is_err());
    }

    #[test]
    fn test_server_identity_is_separate() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let text = "[server]\nidentity = \"source-a\"\n\n[client]\nidentity = \"dest-b\"";
        writeln!(file, "{}", text).unwrap();
        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.identity, "source-a");
        assert_eq!(config.client.identity, "dest-b");
    }

    #[test]
    fn test_secret_is_trimmed() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  s3cret  ").unwrap();
        let auth = AuthConfig {
            shared_secret_file: Some(file.path().to_path_buf()),
        };
        assert_eq!(auth.load_secret().unwrap().unwrap(), b"s3cret");
    }
}
