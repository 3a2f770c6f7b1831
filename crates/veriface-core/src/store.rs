//! Enrollment store interface consumed by the pipeline.
//!
//! The store owns [`EnrollmentRecord`]s; the pipeline only reads recent
//! history and appends confirmed captures. Implementations wrap each append
//! in a transaction and roll it back on failure.

use thiserror::Error;

use crate::types::{Embedding, EnrollmentRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    /// Store unreachable, or a read against it failed.
    #[error("enrollment store unavailable: {0}")]
    Unavailable(String),
    /// An append failed; the surrounding transaction was rolled back.
    #[error("failed to append enrollment record: {0}")]
    WriteFailed(String),
}

impl StoreError {
    /// Machine-readable error code for the process-boundary record.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "StoreUnavailable",
            StoreError::WriteFailed(_) => "StoreWriteFailed",
        }
    }
}

pub trait EnrollmentStore {
    fn identity_exists(&self, identity_id: &str) -> Result<bool, StoreError>;

    /// Most-recent-first enrollment history, capped at `limit`.
    fn fetch_recent(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Result<Vec<EnrollmentRecord>, StoreError>;

    /// Append one record for the identity, returning the new record id.
    fn append(&mut self, identity_id: &str, embedding: &Embedding) -> Result<String, StoreError>;
}
