use thiserror::Error;

use sealdoc_policy::CryptoError;

/// Why a compound document was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfficeFileReason {
    /// The input already carries this protection scheme.
    AlreadyProtected,
    /// The input is not a valid compound document.
    NotOfficeFile,
    /// Protection metadata or payload is missing or damaged, or the caller
    /// was denied a license for it.
    CorruptFile,
    /// The container carries data-space formatting from a different scheme.
    NonRmsProtected,
}

/// Domain errors of the protect/unprotect surface. Failures from the
/// container library and the I/O layer are wrapped into these at the
/// orchestration boundary; no raw `io::Error` escapes.
#[derive(Debug, Error)]
pub enum DrmError {
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("{message}")]
    OfficeFile {
        reason: OfficeFileReason,
        message: String,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl DrmError {
    pub(crate) fn office(reason: OfficeFileReason, message: impl Into<String>) -> Self {
        DrmError::OfficeFile {
            reason,
            message: message.into(),
        }
    }

    pub(crate) fn stream(context: &str, err: std::io::Error) -> Self {
        DrmError::Stream(format!("{context}: {err}"))
    }

    /// The reason when this is an office-file rejection.
    pub fn office_file_reason(&self) -> Option<OfficeFileReason> {
        match self {
            DrmError::OfficeFile { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
