//! One-shot migration of event icons from their original hosts into Cloud Storage.
//!
//! `main` builds the concrete clients and hands them to
//! [`orchestrator::Migrator`], which walks the `"Events"` table once.

pub mod config;
pub mod database_ops;
pub mod fetch;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod sniff;
pub mod storage;

pub mod util {
    pub mod env;
}
