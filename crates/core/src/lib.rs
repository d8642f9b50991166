//! Trunchbull Core: provider sync engine, normalized store, and dashboard aggregation.

pub mod config;
pub mod crypto;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod providers;
pub mod rate_limit;
pub mod sync;
pub mod token_store;
