//! Fabric configuration and hard limits.
//!
//! Configuration is loaded from a JSON file. Every field has a default, so an
//! empty object (`{}`) yields a working fabric with eight bridges of up to
//! 254 ports each.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{Request, RingRequest};

/// Hard upper bound on ports per bridge.
pub const MAX_PORTS: usize = 254;

/// Maximum rings per direction on a switch port.
pub const MAX_RINGS: usize = 16;

/// Maximum entries collected before a flush is forced.
pub const MAX_BATCH: usize = 1024;

/// Maximum slots a single multi-fragment packet may span.
pub const MAX_FRAGS: usize = 64;

/// Default and maximum ring sizes for switch ports.
pub const DEFAULT_SLOTS: u32 = 1024;
pub const MAX_SLOTS: u32 = 4096;

/// Size of every ring buffer in bytes.
pub const DEFAULT_BUF_SIZE: usize = 2048;

/// Default maximum frame size for virtual ports.
pub const DEFAULT_MFS: usize = 1514;

/// Worst-case Ethernet + IPv6 + TCP header size.
pub const DEFAULT_GSO_HEADER_LEN: usize = 14 + 40 + 60;

/// Maximum length of the bridge part of a name and of the port suffix.
pub const MAX_NAME_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Clamp a requested value the way the switch treats user-supplied sizes:
/// values below `lo` fall back to `dflt`, values above `hi` are capped.
pub fn bound_var<T: PartialOrd + Copy>(v: T, dflt: T, lo: T, hi: T) -> T {
    if v < lo {
        dflt
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// Top-level fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Number of bridge slots in the fabric.
    pub max_bridges: usize,
    /// Port capacity of every bridge.
    pub max_ports: usize,
    /// Namespace prefix every bridge name must start with.
    pub name_prefix: String,
    /// Entries collected per forwarding pass.
    pub batch_size: usize,
    /// Header allowance used when sizing deliveries to a port with a
    /// smaller frame size.
    pub gso_header_len: usize,
    /// Ring buffer size in bytes.
    pub buf_size: usize,
    /// Maximum frame size of virtual ports.
    pub default_mfs: usize,
    /// Ring geometry used when an attach request leaves fields at zero.
    pub default_rings: RingRequest,
    /// Control requests applied at startup.
    pub bootstrap: Vec<Request>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_bridges: 8,
            max_ports: MAX_PORTS,
            name_prefix: String::new(),
            batch_size: MAX_BATCH,
            gso_header_len: DEFAULT_GSO_HEADER_LEN,
            buf_size: DEFAULT_BUF_SIZE,
            default_mfs: DEFAULT_MFS,
            default_rings: RingRequest::STANDARD,
            bootstrap: Vec::new(),
        }
    }
}

impl FabricConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FabricConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_bridges == 0 {
            return Err(ConfigError::Invalid("max_bridges must be > 0".into()));
        }
        if self.max_ports == 0 || self.max_ports > MAX_PORTS {
            return Err(ConfigError::Invalid(format!(
                "max_ports must be in 1..={MAX_PORTS}"
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH {
            return Err(ConfigError::Invalid(format!(
                "batch_size must be in 1..={MAX_BATCH}"
            )));
        }
        if self.buf_size < 64 || self.buf_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(
                "buf_size must be in 64..=65535".into(),
            ));
        }
        if self.default_mfs <= self.gso_header_len {
            return Err(ConfigError::Invalid(
                "default_mfs must exceed gso_header_len".into(),
            ));
        }
        if !self.default_rings.is_valid() {
            return Err(ConfigError::Invalid(format!(
                "default_rings out of range: {:?}",
                self.default_rings
            )));
        }
        if self.name_prefix.len() > MAX_NAME_LEN
            || !self
                .name_prefix
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            return Err(ConfigError::Invalid(format!(
                "name_prefix {:?} is not a valid bridge name prefix",
                self.name_prefix
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bound_var() {
        assert_eq!(bound_var(0u32, 1024, 2, 4096), 1024);
        assert_eq!(bound_var(1u32, 1024, 2, 4096), 1024);
        assert_eq!(bound_var(512u32, 1024, 2, 4096), 512);
        assert_eq!(bound_var(9000u32, 1024, 2, 4096), 4096);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = FabricConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_bridges, 8);
        assert_eq!(config.max_ports, 254);
        assert_eq!(config.gso_header_len, 114);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_ports": 16, "name_prefix": "vale", "bootstrap": [
                {{"op": "attach", "name": "vale0:a"}}
            ]}}"#
        )
        .unwrap();

        let config = FabricConfig::load(file.path()).unwrap();
        assert_eq!(config.max_ports, 16);
        assert_eq!(config.name_prefix, "vale");
        assert_eq!(config.batch_size, MAX_BATCH);
        assert_eq!(config.bootstrap.len(), 1);
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_ports": 1000}}"#).unwrap();
        assert!(matches!(
            FabricConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name_prefix": "va-le"}}"#).unwrap();
        assert!(FabricConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FabricConfig::load(Path::new("/nonexistent/switch.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
