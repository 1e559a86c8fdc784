//! Error taxonomy for the ingestion pipeline.
//!
//! Four classes drive how a failure propagates:
//!
//! | Variant | Scope | Handling |
//! |---------|-------|----------|
//! | [`IngestError::Transient`] | one file | logged, file counted as done with zero effect |
//! | [`IngestError::Malformed`] | one document | logged, document yields zero facts |
//! | [`IngestError::Contract`] | one call | raised immediately, nothing written |
//! | [`IngestError::BatchFatal`] | whole batch | batch row marked `failed` with the message |
//!
//! Database errors are carried transparently and treated as batch-fatal when
//! they escape the control loop; inside a worker they only fail their file.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network, disk or external-tool failure. Not retried within an attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed input in {file}: {reason}")]
    Malformed { file: String, reason: String },

    /// The caller handed over something the pipeline cannot accept.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("batch {batch_id} failed: {reason}")]
    BatchFatal { batch_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn malformed(file: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        IngestError::Malformed {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, IngestError::Contract(_))
    }

    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::BatchFatal { .. } | IngestError::Database(_)
        )
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variants() {
        assert!(IngestError::Contract("x".into()).is_contract_violation());
        assert!(!IngestError::Transient("x".into()).is_contract_violation());
        let fatal = IngestError::BatchFatal {
            batch_id: "b".into(),
            reason: "r".into(),
        };
        assert!(fatal.is_batch_fatal());
        assert_eq!(fatal.to_string(), "batch b failed: r");
    }

    #[test]
    fn malformed_message_names_file() {
        let err = IngestError::malformed("a.xml", "unexpected EOF");
        assert_eq!(err.to_string(), "malformed input in a.xml: unexpected EOF");
    }
}
