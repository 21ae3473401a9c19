//! Error types for the block cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the block cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Engine Errors
    // =========================================================================
    /// Every descriptor visited by the eviction sweep was referenced
    #[error("No evictable buffer for block {blockno} on device {dev}: pool exhausted")]
    PoolExhausted { dev: u32, blockno: u32 },

    /// Operation requires the buffer's sleep lock, which the caller does not hold
    #[error("{op} on block {blockno} of device {dev} without holding its buffer lock")]
    NotHeld {
        op: &'static str,
        dev: u32,
        blockno: u32,
    },

    /// Unpin would drop the count below the caller's own reference
    #[error("Unpin of block {blockno} on device {dev} which is not pinned")]
    NotPinned { dev: u32, blockno: u32 },

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Device driver reported a failure
    #[error("Device {dev} failed on block {blockno}: {reason}")]
    Device {
        dev: u32,
        blockno: u32,
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML configuration could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON encoding failed
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Prometheus encoding failed
    #[error("Prometheus encoding failed: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl Error {
    /// True for errors that leave the cache usable and can be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PoolExhausted { dev: 1, blockno: 42 };
        assert_eq!(
            err.to_string(),
            "No evictable buffer for block 42 on device 1: pool exhausted"
        );

        let err = Error::NotHeld {
            op: "write_back",
            dev: 1,
            blockno: 7,
        };
        assert_eq!(
            err.to_string(),
            "write_back on block 7 of device 1 without holding its buffer lock"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::PoolExhausted { dev: 0, blockno: 0 }.is_retryable());
        assert!(!Error::NotPinned { dev: 0, blockno: 0 }.is_retryable());
        assert!(!Error::Config("zero shards".into()).is_retryable());
    }
}
