//! An in-memory, block-addressed filesystem image with a write-ahead
//! journal for crash-consistent metadata and data updates.
//!
//! The on-disk layout ([`layout`]) is a superblock, a free-block bitmap
//! ([`bitmap`]), a flat inode table, a fixed-size journal region
//! ([`journal`]), and a data region holding direct/indirect/doubly-indirect
//! file chains ([`inode`]). Every structural mutation — file growth and
//! shrinkage ([`resize`]), directory entry changes ([`dir`]), and block
//! writes ([`file`]) — goes through the journal so that a crash mid-write
//! leaves the image equivalent to either the pre- or post-operation state.
//! [`fs::FileSystem`] wires the pieces together behind a single exclusive
//! lock and exposes the VFS-facing surface.
pub mod bitmap;
pub mod dir;
pub mod error;
pub mod file;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod resize;
pub mod store;

pub use error::{FsError, Result};
pub use fs::FileSystem;
pub use layout::{FileType, ROOT_INODE};
