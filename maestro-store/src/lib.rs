//! # maestro-store
//!
//! In-memory [`maestro_core::Repository`] implementation plus
//! per-conversation history compression. The on-disk format of a
//! production store is out of scope; everything the runtime needs goes
//! through the repository trait, so swapping in a database-backed
//! implementation is a drop-in change.

pub mod compression;
pub mod memory;

pub use compression::{CompressionConfig, compress_messages};
pub use memory::MemoryRepository;
