//! Work Queue: durable, priority-ordered store of work items with exclusive claim.
//!
//! `QueueDb` owns every status transition. Workers go through [`QueueHandle`],
//! which moves the synchronous SQLite calls onto the blocking pool.

pub mod db;
pub mod models;

pub use db::{ItemCursor, QueueDb, QueueHandle};
pub use models::*;
