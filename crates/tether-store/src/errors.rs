//! Store error types.

/// Errors from [`MetadataStore`](crate::MetadataStore) operations.
///
/// A corrupt file found while opening is not an error: it is moved aside and
/// the store starts empty.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure (create, write, fsync, rename).
    #[error("metadata store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("metadata store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Error category string for logs and reports.
    pub fn category(&self) -> &str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(err.error)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn io_error_display_and_category() {
        let err = StoreError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_matches!(&err, StoreError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("denied"));
        assert_eq!(err.category(), "io");
    }

    #[test]
    fn json_error_category() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err = StoreError::from(json_err);
        assert_matches!(err, StoreError::Json(_));
        assert_eq!(err.category(), "json");
    }

    #[test]
    fn failed_persist_becomes_io() {
        let dir = tempfile::tempdir().unwrap();
        let temp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let target = dir.path().join("missing").join("sessions.json");
        let persist_err = temp.persist(&target).unwrap_err();
        assert_matches!(StoreError::from(persist_err), StoreError::Io(_));
    }
}
