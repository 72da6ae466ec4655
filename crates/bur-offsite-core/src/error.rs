//! Layered error types for the backup transfer pipeline.

use thiserror::Error;

/// Errors raised by [`crate::remote::RemoteStore`] implementations.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("ssh command to '{host}' timed out after {timeout_secs}s: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout_secs: u64,
    },

    #[error("ssh command to '{host}' failed: {stderr}")]
    Ssh { host: String, stderr: String },

    #[error("transfer of '{path}' failed: expected {expected} files, transferred {actual}")]
    Transfer {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("could not parse rsync output: {0}")]
    RsyncParse(String),

    #[error("could not parse command output for '{what}': {detail}")]
    ParseFailure { what: String, detail: String },

    #[error("io error talking to remote: {0}")]
    Io(#[from] std::io::Error),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by [`crate::crypto::CryptoCodec`].
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("gpg permission denied reading keyring at '{path}' (current user: '{user}')")]
    GpgPermissionDenied { path: String, user: String },

    #[error("could not create gpg key for '{0}'")]
    GpgKeyCreationFailed(String),

    #[error("failed to compress '{path}': {detail}")]
    CompressFailed { path: String, detail: String },

    #[error("failed to encrypt '{path}': {detail}")]
    EncryptFailed { path: String, detail: String },

    #[error("failed to decompress '{path}': {detail}")]
    DecompressFailed { path: String, detail: String },

    #[error("failed to decrypt '{path}': {detail}")]
    DecryptFailed { path: String, detail: String },

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised while validating a backup set or a volume's metadata.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("metadata file missing or unreadable for volume '{0}'")]
    MetadataUnreadable(String),

    #[error("metadata content invalid for volume '{volume}': {reason}")]
    MetadataInvalid { volume: String, reason: String },

    #[error("checksum mismatch for '{file}' in volume '{volume}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        volume: String,
        file: String,
        expected: String,
        actual: String,
    },

    #[error("not enough free disk space at '{path}': required {required_mb}MB, available {available_mb}MB")]
    InsufficientDiskSpace {
        path: String,
        required_mb: u64,
        available_mb: u64,
    },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Top-level error type, covering every error kind named in the spec.
#[derive(Error, Debug)]
pub enum BurError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not enough disk space: {0}")]
    DiskSpace(ValidationError),

    #[error("failed to encode volume '{volume}': {reason}")]
    Encode { volume: String, reason: String },

    #[error("failed to decode volume '{volume}': {reason}")]
    Decode { volume: String, reason: String },

    #[error(transparent)]
    Transfer(#[from] RemoteError),

    #[error("unknown backup tag '{0}'")]
    UnknownBackupTag(String),

    #[error("BACKUP_OK success flag is missing from '{0}'")]
    MissingSuccessFlag(String),

    #[error("volume-list descriptor is missing or empty for '{0}'")]
    NoVolumeList(String),

    #[error("metadata validation failed: {0}")]
    MetadataValidationFailed(ValidationError),

    #[error("expected volume '{0}' was not found")]
    MissingVolume(String),

    #[error("download of backup '{backup}' failed: {failures:?}")]
    DownloadProcessFailed {
        backup: String,
        failures: Vec<String>,
    },

    #[error("failed to remove stale remote backups: {0:?}")]
    RetentionRemovalFailed(Vec<String>),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("input validation failed: {0}")]
    InvalidInput(String),

    #[error("upload run failed: {0}")]
    UploadFailed(Box<BurError>),

    #[error("download run failed: {0}")]
    DownloadFailed(Box<BurError>),
}

impl From<ValidationError> for BurError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InsufficientDiskSpace { .. } => BurError::DiskSpace(err),
            other => BurError::MetadataValidationFailed(other),
        }
    }
}

pub type BurResult<T> = Result<T, BurError>;

impl BurError {
    /// Process exit code for this failure, per spec §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            BurError::Config(_) | BurError::InvalidInput(_) => 2,
            BurError::Encode { .. } => 3,
            BurError::DiskSpace(_) => 3,
            BurError::Transfer(_) => 3,
            BurError::Decode { .. }
            | BurError::UnknownBackupTag(_)
            | BurError::MissingSuccessFlag(_)
            | BurError::NoVolumeList(_)
            | BurError::MissingVolume(_)
            | BurError::DownloadProcessFailed { .. } => 4,
            BurError::RetentionRemovalFailed(_) => 5,
            BurError::MetadataValidationFailed(_) | BurError::Crypto(_) => 6,
            BurError::UploadFailed(inner) => inner.operation_exit_code(3),
            BurError::DownloadFailed(inner) => inner.operation_exit_code(4),
        }
    }

    /// Exit code for an error known to have occurred during a specific run direction.
    /// Operation-agnostic codes (invalid input, validation/crypto failure) pass through
    /// unchanged; ambiguous codes that `exit_code()` otherwise defaults to 3 (`DiskSpace`,
    /// `Transfer`) are corrected to `op_code`, the code for the run that actually failed.
    fn operation_exit_code(&self, op_code: i32) -> i32 {
        match self {
            BurError::Config(_) | BurError::InvalidInput(_) => 2,
            BurError::RetentionRemovalFailed(_) => 5,
            BurError::MetadataValidationFailed(_) | BurError::Crypto(_) => 6,
            _ => op_code,
        }
    }
}
