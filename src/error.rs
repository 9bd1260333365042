use std::{fmt::Display, io, num::NonZeroU32};

use crate::platform::format_os_error_code;

/// Error returned from engine operations.
///
/// Outcomes of a transfer that reached the device (stall, short packet,
/// cancellation...) are not errors: they are reported in the
/// [`UrbStatus`][crate::UrbStatus] of the returned request.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    pub(crate) fn new_os(kind: ErrorKind, message: &'static str, code: u32) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[track_caller]
    pub(crate) fn log_error(self) -> Self {
        log::error!("{}", self);
        self
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the `errno` value reported by the kernel, if applicable.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (")?;
            format_os_error_code(f, code.get())?;
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Disconnected => io::ErrorKind::NotConnected,
            ErrorKind::Busy => io::ErrorKind::Other, // TODO: ResourceBusy once MSRV allows
            ErrorKind::TimedOut => io::ErrorKind::TimedOut,
            ErrorKind::InvalidArgument | ErrorKind::Capacity => io::ErrorKind::InvalidInput,
            ErrorKind::NotSubmitted | ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Device is disconnected. Every further operation on the engine fails
    /// with this kind.
    Disconnected,

    /// The transfer cannot be split into fragments within the kernel's
    /// per-URB buffer limit.
    Capacity,

    /// Cancel or forget was called for a handle the engine does not know.
    NotSubmitted,

    /// The handle is already outstanding, or the request is in a state that
    /// does not allow the operation.
    Busy,

    /// A synchronous transfer did not complete in time.
    TimedOut,

    /// The request is malformed (for example isochronous packets that do
    /// not fit in its buffer).
    InvalidArgument,

    /// This user does not have permission to perform the requested operation.
    PermissionDenied,

    /// Requested device, interface, or alternate setting not found.
    NotFound,

    /// The requested operation is not supported for this transfer type.
    Unsupported,

    /// Uncategorized error.
    Other,
}
