//! Safe, stateful wrapper over kernel event ports.
//!
//! An event port is a single kernel object through which a process registers
//! interest in paths and descriptors and later retrieves fired events. The
//! raw primitives are minimal: associations are fire-once, and the only
//! context the kernel carries back is one opaque word. This crate builds a
//! leak-free API on top of them:
//!
//! - [`EventPort`]: associate, dissociate and retrieve with typed tokens
//! - [`CookieJar`]: process-owned token storage; only ids cross the kernel
//!   boundary
//! - [`WatchRegistry`]: live associations per path and per descriptor
//! - [`Kernel`]: the consumed primitives, implemented by [`LabKernel`]
//!   (deterministic, in-process) and, on illumos and Solaris,
//!   `SystemKernel`
//!
//! # Fire-once reconciliation
//!
//! When the kernel fires, it drops the association without telling anyone.
//! A later [`EventPort::dissociate_path`] therefore fails with
//! [`Error::NotAssociated`]: that is the expected outcome, the entry moves to
//! the pending set and its event still resolves to the right token when
//! drained, even if the same path was re-associated in the meantime with an
//! equal token.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod port;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, PortConfig};
pub use error::{Error, ErrorKind, KernelOp, Recoverability, Result};
pub use port::{
    CookieId, CookieJar, EventMask, EventPort, FileStamp, Kernel, LabKernel, PendingCause,
    PortEvent, PortSnapshot, RawEvent, SourceKind, Timespec, WatchRegistry, WatchedObject,
};

#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use port::{SystemKernel, SystemPort};
