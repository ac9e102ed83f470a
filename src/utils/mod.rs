// src/utils/mod.rs
//! Common utilities: error types and configuration

pub mod config;
pub mod errors;
