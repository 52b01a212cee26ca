//! Foundational and often-reused types.

pub mod buffer_pool;
pub mod dedup;
pub mod id;
pub mod message;
pub mod node;
