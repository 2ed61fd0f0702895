//! Storage contract for documents and their operation logs.
//!
//! Backends are content-addressed by document id and must enforce one
//! invariant: two different operations can never be committed at the same
//! (scope, index, skip) position of one document. Optimistic backends
//! signal transient write races with [`StorageError::Serialization`], which
//! [`with_retry`] retries with jittered exponential backoff; everything
//! else is final.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::document::{Document, Operation, Scope};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("document with id {0} not found")]
    NotFound(String),
    #[error("document with id {0} already exists")]
    AlreadyExists(String),
    /// A different operation is already committed at this position.
    #[error("operation {}:{} conflicts with a stored operation", attempted.index, attempted.skip)]
    Conflict {
        existing: Box<Operation>,
        attempted: Box<Operation>,
    },
    /// Transient write race, safe to retry.
    #[error("storage transaction aborted: {0}")]
    Serialization(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Serialization(_))
    }
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Stores a new document. Fails with [`StorageError::AlreadyExists`] if
    /// the id is taken.
    async fn create_document(
        &self,
        document_id: &str,
        document: Document,
    ) -> Result<(), StorageError>;

    async fn document_exists(&self, document_id: &str) -> Result<bool, StorageError>;

    async fn get_document(&self, document_id: &str) -> Result<Document, StorageError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), StorageError>;

    async fn document_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Atomically appends `operations` to the stored logs and updates the
    /// state of the scopes the batch touches from `document`. Scopes the
    /// batch does not touch keep their stored state, so a concurrent
    /// commit on the other scope survives. Re-committing an operation that
    /// is already stored byte-for-byte is a no-op; committing a different
    /// operation at an occupied position fails with
    /// [`StorageError::Conflict`].
    async fn add_operations(
        &self,
        document_id: &str,
        operations: &[Operation],
        document: &Document,
    ) -> Result<(), StorageError>;

    /// Cached post-state of the operation at `index` in `scope`, if the
    /// backend kept one.
    async fn get_resulting_state(
        &self,
        document_id: &str,
        scope: Scope,
        index: u64,
    ) -> Result<Option<String>, StorageError>;
}

/// Backoff policy for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

/// Runs `operation` until it succeeds or fails with a non-retryable error.
/// Only [`StorageError::Serialization`] is retried; domain failures such as
/// conflicts surface immediately.
pub async fn with_retry<T, F, Fut>(options: &RetryOptions, mut operation: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Err(err) if err.is_retryable() && attempt < options.max_retries => {
                attempt += 1;
                let exp = options
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(options.max_delay);
                // full delay between exp/2 and exp
                let delay = exp.mul_f64(0.5 + rand::random::<f64>() * 0.5);
                tracing::debug!(attempt, ?delay, "retrying storage write: {err}");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_serialization_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&RetryOptions::default(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StorageError::Serialization("write race".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_domain_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryOptions::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::NotFound("doc".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let options = RetryOptions {
            max_retries: 3,
            ..Default::default()
        };
        let result: Result<(), _> = with_retry(&options, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StorageError::Serialization("still racing".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
