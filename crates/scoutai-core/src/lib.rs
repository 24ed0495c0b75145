// Shared types for every ScoutAI context: the message envelope, error
// taxonomy, draft data model, platform predicates, settings and config.

pub mod config;
pub mod db;
pub mod draft;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod settings;

pub use error::ScoutError;
