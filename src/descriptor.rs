//! File descriptor module
//!
//! Identifies the target of one transfer: relative name, size, and the
//! version stamp advertised by the holder of the authoritative copy.
//! Immutable for the lifetime of a swarm.

use serde::{Deserialize, Serialize};

/// Identifies one logical file being transferred
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Relative path of the file within the synced tree
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// Monotonically increasing version counter
    pub version: u64,
    /// Modification time in milliseconds since the epoch
    pub modified_millis: u64,
}

impl FileDescriptor {
    /// Create a new file descriptor
    pub fn new(name: impl Into<String>, size: u64, version: u64, modified_millis: u64) -> Self {
        Self {
            name: name.into(),
            size,
            version,
            modified_millis,
        }
    }

    /// True if both descriptors refer to the exact same file version.
    /// Filesystems differ in timestamp precision, so modification times
    /// are compared at two-second granularity.
    pub fn is_same_version(&self, other: &FileDescriptor) -> bool {
        self.name == other.name
            && self.size == other.size
            && self.version == other.version
            && self.modified_millis / 2000 == other.modified_millis / 2000
    }

    /// True if `other` describes a newer version of the same file
    pub fn is_newer_than(&self, other: &FileDescriptor) -> bool {
        self.name == other.name && self.version > other.version
    }

    /// Hex identifier derived from the file name, for temp-file bookkeeping
    pub fn file_id(&self) -> String {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} bytes, v{})", self.name, self.size, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_version() {
        let a = FileDescriptor::new("docs/report.txt", 1000, 3, 1_700_000_000_000);
        let b = a.clone();
        assert!(a.is_same_version(&b));
    }

    #[test]
    fn test_timestamp_granularity() {
        let a = FileDescriptor::new("docs/report.txt", 1000, 3, 1_700_000_000_000);
        let b = FileDescriptor::new("docs/report.txt", 1000, 3, 1_700_000_001_000);
        // Within the same two-second bucket
        assert!(a.is_same_version(&b));

        let c = FileDescriptor::new("docs/report.txt", 1000, 3, 1_700_000_004_000);
        assert!(!a.is_same_version(&c));
    }

    #[test]
    fn test_version_mismatch() {
        let a = FileDescriptor::new("docs/report.txt", 1000, 3, 1_700_000_000_000);
        let b = FileDescriptor::new("docs/report.txt", 1000, 4, 1_700_000_000_000);
        assert!(!a.is_same_version(&b));
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
    }

    #[test]
    fn test_newer_different_name() {
        let a = FileDescriptor::new("a.txt", 10, 1, 0);
        let b = FileDescriptor::new("b.txt", 10, 2, 0);
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn test_file_id_stable() {
        let a = FileDescriptor::new("docs/report.txt", 1000, 3, 0);
        let b = FileDescriptor::new("docs/report.txt", 2000, 9, 5);
        // Derived from the name only
        assert_eq!(a.file_id(), b.file_id());
        assert_eq!(a.file_id().len(), 40);
    }
}
