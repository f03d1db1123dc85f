//! Errors of the node process.

/// A wrap `Result` contains custom errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors enum mapping global custom errors.
/// The error type can be expressed in decimal, where the high decs represent
/// the error category and the low decs represent the error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[repr(u32)]
pub enum Error {
    #[error("Create File Error: {0}")]
    CreateFileError(String) = 100,
    #[error("Open File Error: {0}")]
    OpenFileError(String) = 101,
    #[error("Cannot find home directory")]
    HomeDirError = 102,
    #[error("Cannot find parent directory")]
    ParentDirError = 103,
    #[error("Serde yaml error: {0}")]
    SerdeYamlError(#[from] serde_yaml::Error) = 200,
    #[error("Invalid logging level: {0}")]
    InvalidLoggingLevel(String) = 201,
    #[error("Invalid address: {0}")]
    InvalidAddress(String) = 202,
    #[error("Bind socket {0} failed: {1}")]
    BindError(String, std::io::Error) = 300,
    #[error("Socket IO error: {0}")]
    SocketError(#[from] std::io::Error) = 301,
    #[error("Core error: {0}")]
    CoreError(#[from] mercury_core::Error) = 400,
}

impl Error {
    /// Numeric code of the variant.
    pub fn code(&self) -> u32 {
        // SAFETY: `Self` is `repr(u32)`, so its layout starts with the `u32` discriminant.
        unsafe { *<*const _>::from(self).cast::<u32>() }
    }
}
