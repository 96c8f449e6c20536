//! Query functions over a borrowed `PgConnection`, shared by the pooled
//! database and by open transactions.

pub mod attachments;
pub mod tasks;
