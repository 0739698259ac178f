//! # HiveDB - Transactional Hierarchical Key/Value Store
//!
//! HiveDB is an embedded storage engine for hierarchical key/value data
//! ("hives"): a tree of named keys, each carrying named typed values,
//! persisted in a self-describing binary image with crash-consistent
//! flushes. The design prioritizes:
//!
//! - **Bounded memory**: a fixed-capacity window cache over the image;
//!   cold regions are paged in on demand, never the whole file
//! - **Crash consistency**: paired sequence numbers plus dirty-block
//!   tracking make every flush all-or-nothing
//! - **Hostile-input tolerance**: a corrupt or adversarial image is
//!   walked with explicit stacks and bounds checks, never trusted
//!
//! ## Quick Start
//!
//! ```ignore
//! use hivedb::{Hive, HiveConfig, FileStore, StorageKind};
//!
//! let backing = Box::new(FileStore::create("app.hive", 0)?);
//! let mut hive = Hive::create(backing, HiveConfig::default())?;
//!
//! let root = hive.create_root_key(b"machine")?;
//! let key = hive.create_key(root, b"service", StorageKind::Stable)?;
//! hive.set_key_value(key, b"port", 4, &8080u32.to_le_bytes())?;
//! hive.flush()?;
//! ```
//!
//! ## Image Layout
//!
//! ```text
//! hive file
//! ├── base block           # signature, sequence pair, root cell, length
//! └── bins                 # packed, each a signature/size header plus
//!     ├── bin              # variable-length cells (signed size words:
//!     │   ├── cell         # negative = allocated, positive = free)
//!     │   └── cell
//!     └── bin
//! ```
//!
//! Cells are addressed by [`CellId`]: a storage-class bit (stable data
//! persists, volatile data lives only in memory) and a 31-bit offset.
//! Stable bins at rest are read through fixed-size file views; freshly
//! created and volatile bins live in heap buffers until flushed.
//!
//! ## Module Overview
//!
//! - [`hive`]: base block, bins, storage map, cell allocator, flush
//! - [`views`]: fixed-size window cache with pinning and LRU eviction
//! - [`tree`]: key nodes, sorted subkey indices, bulk tree operations
//! - [`value`]: value descriptors and the small/normal/big data codec
//! - [`check`]: consistency checker with policy-gated self-healing
//! - [`kcb`]: path resolution cache backed by page slab allocators
//! - [`io`]: file backing trait, real files and in-memory images

#[macro_use]
mod macros;

pub mod check;
pub mod config;
pub mod hive;
pub mod io;
pub mod kcb;
pub mod tree;
pub mod value;
pub mod views;

pub use check::{CheckCode, CheckDebug, CheckFlags, CheckOutcome};
pub use config::HiveConfig;
pub use hive::{CellId, Hive, HiveError, StorageKind};
pub use io::{FileBacking, FileStore, MemoryBacking};
pub use kcb::KcbCache;
pub use tree::{KeyMeta, RemapTable};
pub use value::ValueMeta;
