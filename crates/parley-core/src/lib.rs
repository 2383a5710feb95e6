//! Core types, config, errors, and conversation log for Parley.

pub mod config;
pub mod conversation;
pub mod error;
pub mod types;
