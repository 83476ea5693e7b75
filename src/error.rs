use thiserror::Error;

/// Result type alias for chunkfs operations
pub type Result<T> = std::result::Result<T, DfsError>;

#[derive(Error, Debug)]
pub enum DfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid chunk id: {0}")]
    InvalidChunkId(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("no replicas accepted chunk {0}")]
    ChunkPlacementFailed(String),

    #[error("chunk {0} unavailable from all replicas")]
    ChunkUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DfsError::FrameTooLarge {
            size: 200,
            max: 100,
        };
        assert_eq!(err.to_string(), "frame too large: 200 bytes (max 100)");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DfsError = io_err.into();
        assert!(matches!(err, DfsError::Io(_)));
    }
}
