//! Low-level primitives for building the storage engine.
//!
//! Positioned IO backends and the paging layer that hands out
//! transaction-private page images.

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Paging subsystem.
///
/// Page allocation, page latches, copy-on-write write transactions and a
/// cache of committed images.
pub mod pager;
