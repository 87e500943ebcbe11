//! File carving: session states, carve queries and archive naming.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Value of the `carve` column in a scheduled-carve result row.
pub const CARVE_REQUESTED: &str = "1";

/// Lifecycle state of a carve session.
///
/// Wire strings follow the agent protocol's spelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CarveStatus {
    /// Requested through a query result, not yet initialized by the agent.
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    /// Session created, no block received yet.
    #[serde(rename = "INITIALIZED")]
    Initialized,
    /// At least one block received.
    #[serde(rename = "IN PROGRESS")]
    InProgress,
    /// All declared blocks received, or completed administratively.
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl CarveStatus {
    /// Parse from the stored string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "INITIALIZED" => Ok(Self::Initialized),
            "IN PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            _ => Err(crate::Error::InvalidCarveStatus(s.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Initialized => "INITIALIZED",
            Self::InProgress => "IN PROGRESS",
            Self::Completed => "COMPLETED",
        }
    }

    /// Check whether blocks may be accepted in this state.
    pub fn accepts_blocks(&self) -> bool {
        matches!(self, Self::Initialized | Self::InProgress)
    }

    /// Status after `completed` of `total` blocks have been received.
    pub fn for_progress(completed: i64, total: i64) -> Self {
        if total > 0 && completed >= total {
            Self::Completed
        } else if completed > 0 {
            Self::InProgress
        } else {
            Self::Initialized
        }
    }
}

impl std::fmt::Display for CarveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where carved block bytes are kept.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarverBackend {
    /// Block bytes live in the metadata database.
    #[default]
    Db,
    /// Block bytes live in the object store; the database keeps the key.
    Storage,
}

impl CarverBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Storage => "storage",
        }
    }
}

/// Declared geometry of a carve, as sent by the agent on init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CarveGeometry {
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
}

impl CarveGeometry {
    /// Validate declared sizes against the server's block size limit.
    pub fn validate(&self, max_block_size: u64) -> crate::Result<()> {
        if self.block_count <= 0 {
            return Err(crate::Error::InvalidCarve(format!(
                "block_count must be positive, got {}",
                self.block_count
            )));
        }
        if self.block_size <= 0 {
            return Err(crate::Error::InvalidCarve(format!(
                "block_size must be positive, got {}",
                self.block_size
            )));
        }
        if self.carve_size < 0 {
            return Err(crate::Error::InvalidCarve(format!(
                "carve_size must not be negative, got {}",
                self.carve_size
            )));
        }
        if self.block_size as u64 > max_block_size {
            return Err(crate::Error::InvalidCarve(format!(
                "block_size {} exceeds maximum {max_block_size}",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Generate an opaque carve session identifier.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the agent query that triggers a carve of `path`.
///
/// Paths containing `%` are treated as patterns.
pub fn carve_query(path: &str) -> String {
    let escaped = path.replace('\'', "''");
    if path.contains('%') {
        format!("SELECT * FROM carves WHERE carve=1 AND path LIKE '{escaped}';")
    } else {
        format!("SELECT * FROM carves WHERE carve=1 AND path = '{escaped}';")
    }
}

/// Check whether the first block of a carve is a zstd frame.
pub fn is_zstd(first_block: &[u8]) -> bool {
    first_block.starts_with(&ZSTD_MAGIC)
}

/// File name of a reassembled carve archive.
///
/// `<uuid>_<session>_<path>.tar`, with path separators replaced by `-` and
/// `.zst` appended for zstd-compressed carves.
pub fn archive_file_name(uuid: &str, session_id: &str, path: &str, zstd: bool) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let mut name = format!("{uuid}_{session_id}_{sanitized}.tar");
    if zstd {
        name.push_str(".zst");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [
            CarveStatus::Scheduled,
            CarveStatus::Initialized,
            CarveStatus::InProgress,
            CarveStatus::Completed,
        ] {
            assert_eq!(CarveStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_eq!(CarveStatus::InProgress.as_str(), "IN PROGRESS");
        assert!(CarveStatus::parse("in progress").is_err());
    }

    #[test]
    fn test_status_for_progress() {
        assert_eq!(CarveStatus::for_progress(0, 3), CarveStatus::Initialized);
        assert_eq!(CarveStatus::for_progress(1, 3), CarveStatus::InProgress);
        assert_eq!(CarveStatus::for_progress(3, 3), CarveStatus::Completed);
        assert_eq!(CarveStatus::for_progress(0, 0), CarveStatus::Initialized);
    }

    #[test]
    fn test_geometry_validation() {
        let ok = CarveGeometry {
            block_count: 3,
            block_size: 1024,
            carve_size: 3000,
        };
        assert!(ok.validate(4096).is_ok());
        assert!(CarveGeometry { block_count: 0, ..ok }.validate(4096).is_err());
        assert!(CarveGeometry { block_size: 0, ..ok }.validate(4096).is_err());
        assert!(CarveGeometry { carve_size: -1, ..ok }.validate(4096).is_err());
        assert!(ok.validate(512).is_err());
    }

    #[test]
    fn test_carve_query() {
        assert_eq!(
            carve_query("/etc/hosts"),
            "SELECT * FROM carves WHERE carve=1 AND path = '/etc/hosts';"
        );
        assert_eq!(
            carve_query("/tmp/%.log"),
            "SELECT * FROM carves WHERE carve=1 AND path LIKE '/tmp/%.log';"
        );
        assert_eq!(
            carve_query("/tmp/o'neil"),
            "SELECT * FROM carves WHERE carve=1 AND path = '/tmp/o''neil';"
        );
    }

    #[test]
    fn test_archive_file_name() {
        assert_eq!(
            archive_file_name("ABC", "s1", "/etc/hosts", false),
            "ABC_s1_-etc-hosts.tar"
        );
        assert_eq!(
            archive_file_name("ABC", "s1", "C:\\Windows\\x.log", true),
            "ABC_s1_C:-Windows-x.log.tar.zst"
        );
    }

    #[test]
    fn test_zstd_detection() {
        assert!(is_zstd(&[0x28, 0xb5, 0x2f, 0xfd, 0x00]));
        assert!(!is_zstd(b"ustar"));
        assert!(!is_zstd(&[0x28, 0xb5]));
    }

    #[test]
    fn test_session_ids_are_distinct() {
        let a = generate_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, generate_session_id());
    }
}
