//! A single-file, durable, copy-on-write B-tree keyed by 16-byte hashes.
//!
//! [`btree::Tree`] is the public entry point: [`btree::Tree::create`] lays
//! out a new file, [`btree::Tree::open`] reopens one, and
//! [`btree::Tree::add`]/[`btree::Tree::find`] insert and look up keys. Every
//! published mutation goes through the allocator's extent discipline (see
//! [`allocator`]) so a crash at any point leaves either the old tree or the
//! new one on disk, never a torn mix.

pub mod allocator;
pub mod btree;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod node;

pub use btree::{Tree, ValueReader};
pub use error::{Error, Result};
pub use node::Key;
