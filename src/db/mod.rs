//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `wpp_webhooks::db` — we re-export the
//! repository API and commonly used models for convenience.

pub mod model;
pub mod repo;

pub use model::{Integration, NewRawEvent, RawEventRow};
pub use repo::*;
