// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Result codes for pipeline operations.
//!
//! The pipeline reports outcomes as explicit values, not panics: every
//! fallible node operation returns `Result<_, Error>`, and callers branch on
//! [`Error::kind`]. `EndOfStream` in particular is a normal condition that
//! is recoverable through `seek`.

use std::fmt;

/// Classification of a pipeline failure.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    /// Upstream exhausted; recoverable only through seek.
    EndOfStream,

    /// A consumer wait expired.
    Timeout,

    /// Transport or filesystem failure.
    Io,

    /// No node in the chain recognized the parameter name.
    UnknownParameter,

    /// The operation is invalid for this variant (e.g. resizing a clone frame).
    Unsupported,

    /// Wiring the requested source would create a cycle.
    CyclicGraph,

    /// The node has no upstream source.
    Unattached,

    /// Buffer growth failed; the frame is marked invalid.
    AllocationFailure,

    /// The object previously failed or exceeded capacity; further operations
    /// are refused.
    InvalidState,

    /// The caller supplied a value out of contract.
    InvalidArgument,

    /// An invariant the implementation relies on did not hold.
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EndOfStream => "end of stream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "I/O error",
            ErrorKind::UnknownParameter => "unknown parameter",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::CyclicGraph => "cyclic graph",
            ErrorKind::Unattached => "unattached",
            ErrorKind::AllocationFailure => "allocation failure",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline error: a kind, an optional human-readable message, and an
/// optional source error.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn msg<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            msg: None,
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.msg {
            write!(f, ": {msg}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrap(ErrorKind::Io, e)
    }
}

/// Constructs an [`Error`], naming its kind as the first argument.
///
/// ```
/// use nightjar_base::{err, ErrorKind};
/// let e = err!(UnknownParameter, "no such key: {}", "bitrate");
/// assert_eq!(e.kind(), ErrorKind::UnknownParameter);
/// assert_eq!(e.to_string(), "unknown parameter: no such key: bitrate");
/// ```
#[macro_export]
macro_rules! err {
    ($k:ident) => {
        $crate::Error::new($crate::ErrorKind::$k)
    };
    ($k:ident, $fmt:expr) => {
        $crate::Error::msg($crate::ErrorKind::$k, format!($fmt))
    };
    ($k:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::msg($crate::ErrorKind::$k, format!($fmt, $($arg)+))
    };
}

/// Returns early with an [`Error`] of the named kind.
///
/// ```
/// use nightjar_base::{bail, ErrorKind};
/// let f = || -> Result<(), nightjar_base::Error> {
///     bail!(Unattached, "source isn't set");
/// };
/// assert_eq!(f().unwrap_err().kind(), ErrorKind::Unattached);
/// ```
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*))
    };
}
