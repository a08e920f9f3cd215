//! TUS Upload Server Library
//!
//! Resumable uploads over the TUS 1.0 protocol, backed by local disk and a
//! SQLite record of upload status. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, admission queue, protocol rules and the reconciliation sweeper
//! - `db`: SQLite pool and the durable upload repository
//! - `routes`: HTTP handlers
//! - `state`: Shared application state

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod upload;
