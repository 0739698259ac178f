//! # Key Tree
//!
//! Keys form a tree rooted at the hive's root cell. Each key is a node
//! cell carrying its name, its parent link, per-storage-class subkey
//! lists, and a value list. Subkey lists are kept sorted by uppercase
//! name so lookup is a binary search and enumeration comes out ordered.
//!
//! The split of subkey lists by storage class is what lets volatile keys
//! vanish on reload without disturbing stable structure: a stable key may
//! carry volatile children, but never the reverse.
//!
//! [`node`] defines the on-disk layouts and name ordering; [`ops`] the
//! operations over them, from single-key CRUD to whole-subtree copy,
//! merge, sync and compaction.

pub mod node;
pub mod ops;

pub use node::{name_cmp, KeyNode, INDEX_SIGNATURE, KEY_SIGNATURE};
pub use ops::{KeyMeta, RemapTable};
