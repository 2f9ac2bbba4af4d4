//! schemalog: changelog-driven database migrations
//!
//! This library reads XML changelogs into an ordered list of changesets,
//! works out which ones a database still needs by comparing checksums with
//! a ledger table stored in that database, and applies them under a
//! database-resident lock. Applied changesets can be tagged and rolled back.

pub mod change;
pub mod changelog;
pub mod checksum;
pub mod config;
pub mod database;
pub mod engine;
pub mod ledger;
pub mod lock;
pub mod output;
pub mod precondition;
pub mod report;

// Re-export commonly used types
pub use changelog::{ChangeLog, ChangeSet, ChangeSetKey, ParseError};
pub use checksum::CheckSum;
pub use config::Config;
pub use database::{Database, DatabaseError, SqliteDatabase};
pub use engine::{Engine, EngineError, RunSettings, load_changelog};
pub use report::{Outcome, RunReport};
