//! Synchronous query functions over a borrowed connection.
//!
//! They are shared by [`SqliteDatabase`](super::SqliteDatabase), which runs
//! them on the blocking pool, and by [`SqliteTransaction`](super::SqliteTransaction),
//! which runs them inside an open transaction.

pub mod attachments;
pub mod tasks;
