// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Errors reported while preparing or flashing an image.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::result;

pub type Result<T> = result::Result<T, Error>;

/// Process exit status used when a file could not be read or written (`EX_IOERR`).
pub const EXIT_FILE_ACCESS: i32 = 74;
/// Process exit status used when the flashing tool could not be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
/// Process exit status used when the flashing tool could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Errors that can be emitted while building an image or running a flash session.
#[derive(Debug)]
pub enum Error {
    /// The source binary could not be read, or the patched image or script could not be written.
    FileAccess { path: PathBuf, source: io::Error },
    /// The flashing tool is missing or could not be started.
    ToolInvocation { tool: OsString, source: io::Error },
    /// The flashing tool ran and reported failure. `None` if it was terminated by a signal.
    ToolFailure(Option<i32>),
    /// An image does not carry a valid checksum trailer.
    InvalidImage(String),
}

impl Error {
    /// Returns a closure wrapping an I/O error with the path it happened on, for use with
    /// `map_err`.
    pub fn file_access(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::FileAccess {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The process exit status this error should be reported with.
    ///
    /// A failing flashing tool has its own exit code propagated unchanged.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::FileAccess { .. } | Self::InvalidImage(_) => EXIT_FILE_ACCESS,
            Self::ToolInvocation { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => EXIT_NOT_FOUND,
                _ => EXIT_NOT_EXECUTABLE,
            },
            Self::ToolFailure(code) => code.unwrap_or(1),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileAccess { path, source } => {
                write!(f, "file access failed for {}: {source}", path.display())
            }
            Self::ToolInvocation { tool, source } => {
                write!(f, "unable to run {}: {source}", tool.to_string_lossy())
            }
            Self::ToolFailure(Some(code)) => write!(f, "flashing tool exited with status {code}"),
            Self::ToolFailure(None) => write!(f, "flashing tool was terminated by a signal"),
            Self::InvalidImage(reason) => write!(f, "invalid image: {reason}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileAccess { source, .. } | Self::ToolInvocation { source, .. } => Some(source),
            Self::ToolFailure(_) | Self::InvalidImage(_) => None,
        }
    }
}
