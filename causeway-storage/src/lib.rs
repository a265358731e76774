//! CAUSEWAY Storage - In-Memory Journal
//!
//! A complete Journal backend holding encoded records in memory. Used by the
//! repository by default and by every test that needs real transactions.

mod memory;

pub use memory::{MemoryJournal, MemoryStore};
