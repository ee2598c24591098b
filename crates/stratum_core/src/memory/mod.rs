//! # Memory Management
//!
//! Chunk storage for archetype rows.
//!
//! ## Design Philosophy
//!
//! Every chunk is one fixed-size block. Blocks are recycled through a pool,
//! so after warm-up structural changes reuse memory instead of allocating:
//! - No chunk ever resizes
//! - Rows stay packed by swap-remove
//! - Column offsets are fixed per archetype

mod bitmask;
mod block;
mod chunk;

pub use bitmask::{Ones, RowMask};
pub use block::{Block, BlockPool, BLOCK_ALIGN};
pub use chunk::{Chunk, ChunkAllocator, ChunkId, ChunkStats};
