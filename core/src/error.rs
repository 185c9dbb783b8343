/// Fault taxonomy for the chunking pipeline.
///
/// Every variant is a deterministic contract violation: the same inputs always
/// produce the same fault, and nothing here is worth retrying.

use thiserror::Error;

/// Errors raised by the chunking core.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// A batch element selected zero boundary positions during downsampling.
    #[error("stage {stage}: batch element {batch} has no boundary positions (empty chunk set)")]
    EmptyChunk { stage: usize, batch: usize },

    /// A position was assigned to a chunk index at or beyond the element's chunk count.
    #[error(
        "stage {stage}: batch element {batch} position {position} maps to chunk {chunk_index}, \
         but only {valid_len} chunks are valid"
    )]
    ChunkIndexOverrun {
        stage: usize,
        batch: usize,
        position: usize,
        chunk_index: usize,
        valid_len: usize,
    },

    /// No boundary at or before this position, so it belongs to no chunk.
    #[error("stage {stage}: batch element {batch} position {position} precedes the first boundary")]
    UnanchoredPosition { stage: usize, batch: usize, position: usize },

    /// A tensor violated the shape-preserving contract.
    #[error("{component}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        component: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type ChunkResult<T> = Result<T, ChunkError>;

impl ChunkError {
    /// Shape fault for a flat buffer whose length disagrees with `expected`.
    pub fn shape(component: impl Into<String>, expected: &[usize], actual_len: usize) -> Self {
        ChunkError::ShapeMismatch {
            component: component.into(),
            expected: expected.to_vec(),
            actual: vec![actual_len],
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        ChunkError::InvalidConfig(msg.into())
    }

    /// True for faults that indicate broken chunk bookkeeping rather than bad caller input.
    pub fn is_bookkeeping_fault(&self) -> bool {
        matches!(
            self,
            ChunkError::EmptyChunk { .. }
                | ChunkError::ChunkIndexOverrun { .. }
                | ChunkError::UnanchoredPosition { .. }
        )
    }
}

/// Check that a flat buffer holds exactly `shape.product()` elements.
pub fn check_len(component: &str, buf: &[f32], shape: &[usize]) -> ChunkResult<()> {
    let expected: usize = shape.iter().product();
    if buf.len() != expected {
        return Err(ChunkError::shape(component, shape, buf.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrun_message_names_location() {
        let e = ChunkError::ChunkIndexOverrun {
            stage: 1, batch: 0, position: 7, chunk_index: 3, valid_len: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("stage 1"), "{msg}");
        assert!(msg.contains("batch element 0"), "{msg}");
        assert!(msg.contains("position 7"), "{msg}");
        assert!(e.is_bookkeeping_fault());
    }

    #[test]
    fn test_check_len() {
        let buf = vec![0.0f32; 12];
        assert!(check_len("x", &buf, &[2, 3, 2]).is_ok());
        match check_len("encoder", &buf, &[2, 3, 3]) {
            Err(ChunkError::ShapeMismatch { component, expected, actual }) => {
                assert_eq!(component, "encoder");
                assert_eq!(expected, vec![2, 3, 3]);
                assert_eq!(actual, vec![12]);
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_config_error_not_bookkeeping() {
        assert!(!ChunkError::config("bad").is_bookkeeping_fault());
    }
}
