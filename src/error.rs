//! Error types for event port operations.
//!
//! Every failure is surfaced to the immediate caller; nothing in this crate
//! retries. Errors fall into a small taxonomy:
//!
//! - **Registry**: [`Error::AlreadyAssociated`], [`Error::NotAssociated`]
//! - **Kernel**: [`Error::KernelRejected`] carrying the untouched OS error
//! - **Retrieval**: [`Error::TimedOut`]
//! - **Lifecycle**: [`Error::Closed`], [`Error::InvalidArgument`]
//! - **Internal**: [`Error::InternalInconsistency`] (bookkeeping bug)
//!
//! # Recovery Classification
//!
//! [`ErrorKind::recoverability`] tells the caller what to do with an error:
//! - `Transient`: nothing happened yet, try again later
//! - `Expected`: a normal outcome of the fire-once race or of caller misuse
//! - `Permanent`: the request cannot succeed as issued
//! - `Fatal`: internal state can no longer be trusted

use std::io;

use crate::port::{CookieId, WatchedObject};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Kernel operation that produced a [`Error::KernelRejected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    /// `port_create`
    Create,
    /// `port_associate`
    Associate,
    /// `port_dissociate`
    Dissociate,
    /// `port_get` / `port_getn`
    Get,
    /// `port_send` used to interrupt a blocked retrieval.
    Wake,
}

impl KernelOp {
    /// Returns the primitive's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Associate => "associate",
            Self::Dissociate => "dissociate",
            Self::Get => "get",
            Self::Wake => "wake",
        }
    }
}

impl std::fmt::Display for KernelOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by [`EventPort`](crate::EventPort).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The object already has a live association on this port.
    #[error("{object} is already associated")]
    AlreadyAssociated {
        /// The object that was requested.
        object: WatchedObject,
    },

    /// The object is not associated, usually because the kernel already
    /// fired its event and dropped the association.
    #[error("{object} is not associated")]
    NotAssociated {
        /// The object that was requested.
        object: WatchedObject,
    },

    /// The underlying kernel primitive failed.
    #[error("kernel rejected {op}: {source}")]
    KernelRejected {
        /// Which primitive failed.
        op: KernelOp,
        /// The OS error as reported by the kernel.
        #[source]
        source: io::Error,
    },

    /// No event arrived before the deadline.
    #[error("timed out waiting for an event")]
    TimedOut,

    /// A retrieved event carried a cookie id unknown to the jar.
    #[error(
        "internal inconsistency: cookie {cookie} unresolved (active: {active}, pending: {pending})"
    )]
    InternalInconsistency {
        /// The unresolved cookie id.
        cookie: CookieId,
        /// Active entries at the time of failure.
        active: usize,
        /// Pending entries at the time of failure.
        pending: usize,
    },

    /// The port has been closed.
    #[error("event port is closed")]
    Closed,

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Wraps an OS error from a kernel primitive.
    #[must_use]
    pub fn kernel(op: KernelOp, source: io::Error) -> Self {
        Self::KernelRejected { op, source }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyAssociated { .. } => ErrorKind::AlreadyAssociated,
            Self::NotAssociated { .. } => ErrorKind::NotAssociated,
            Self::KernelRejected { .. } => ErrorKind::KernelRejected,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::InternalInconsistency { .. } => ErrorKind::InternalInconsistency,
            Self::Closed => ErrorKind::Closed,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Returns the raw OS error code for kernel failures.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::KernelRejected { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true for the expected fire-once outcome of a dissociation.
    #[must_use]
    pub const fn is_not_associated(&self) -> bool {
        matches!(self, Self::NotAssociated { .. })
    }

    /// Returns true if the retrieval deadline elapsed.
    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// The kind of error, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::AlreadyAssociated`].
    AlreadyAssociated,
    /// See [`Error::NotAssociated`].
    NotAssociated,
    /// See [`Error::KernelRejected`].
    KernelRejected,
    /// See [`Error::TimedOut`].
    TimedOut,
    /// See [`Error::InternalInconsistency`].
    InternalInconsistency,
    /// See [`Error::Closed`].
    Closed,
    /// See [`Error::InvalidArgument`].
    InvalidArgument,
}

impl ErrorKind {
    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::TimedOut => Recoverability::Transient,
            Self::AlreadyAssociated | Self::NotAssociated => Recoverability::Expected,
            Self::KernelRejected | Self::Closed | Self::InvalidArgument => {
                Recoverability::Permanent
            }
            Self::InternalInconsistency => Recoverability::Fatal,
        }
    }
}

/// How the caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Nothing changed; the operation may succeed later.
    Transient,
    /// A normal, non-anomalous outcome.
    Expected,
    /// Retrying the same request will fail the same way.
    Permanent,
    /// Bookkeeping is corrupt.
    Fatal,
}
