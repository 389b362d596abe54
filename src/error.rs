//! Typed errors for callers that branch on the failure kind.
//!
//! Everything else flows through `anyhow`.

use crate::models::Modality;
use thiserror::Error;

/// A media payload rejected before any remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("empty payload")]
    Empty,

    #[error("malformed base64: {0}")]
    MalformedBase64(String),

    #[error("malformed data URL: expected `data:<mime>;base64,<data>`")]
    MalformedDataUrl,
}

/// Why a submission was not accepted.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("submission must contain text, images, audios or videos")]
    EmptySubmission,

    #[error("{modality} #{index} is invalid: {source}")]
    InvalidMedia {
        modality: Modality,
        index: usize,
        #[source]
        source: MediaError,
    },

    #[error("task queue is full, task {task_id} marked failed")]
    QueueFull { task_id: String },

    #[error("scheduler is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SubmitError::InvalidMedia {
            modality: Modality::Image,
            index: 2,
            source: MediaError::Empty,
        };
        assert_eq!(err.to_string(), "image #2 is invalid: empty payload");

        let full = SubmitError::QueueFull {
            task_id: "TASK-1".to_string(),
        };
        assert!(full.to_string().contains("queue is full"));
    }
}
