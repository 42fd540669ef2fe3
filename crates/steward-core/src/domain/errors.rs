//! Errors - ストア呼び出しと reconcile の失敗
//!
//! ストア呼び出しは型付きの [`StoreError`] を返す。リトライループはメッセージを
//! 見ずに、CAS 競合とバックエンド停止を区別できる。

use thiserror::Error;

/// ErrorKind は reconcile 失敗の分類（リトライ判断に使う）
///
/// - Transient: 一時的なエラー（バックオフ付きでリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味、ログして破棄）
/// - Infrastructure: ストア側の障害（バックオフ付きでリトライ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// StoreError はストア操作の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The record does not exist.
    #[error("not found")]
    NotFound,

    /// The write carried a stale version, or a create raced with another writer.
    #[error("conflict: stale resource version")]
    Conflict,

    /// Backend or network failure; the caller may try again later.
    #[error("store unavailable: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        StoreError::Transient(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// ReconcileError は 1 キー分の reconcile の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct ReconcileError {
    kind: ErrorKind,
    message: String,
}

impl ReconcileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::Transient(_) => ErrorKind::Infrastructure,
            StoreError::Conflict | StoreError::NotFound => ErrorKind::Transient,
        };
        Self::new(kind, err.to_string())
    }
}
