//! rollcall-store: durable state for the attendance engine.
//!
//! Face profiles live on disk as one JSON record per identity key, next to
//! the enrollment image. Roster, schedules and attendance records live in
//! SQLite, where the (identity, date, period) uniqueness rule is enforced by
//! a partial unique index.

pub mod db;
pub mod error;
pub mod profiles;
pub mod schema;

pub use db::Database;
pub use error::{Result, StoreError};
pub use profiles::{profile_key, ProfileStore};
