//! # vhub-cli
//!
//! Command-line client for VideoHub-class routers: configuration loading
//! and batch argument parsing. The binary lives in `main.rs`.

pub mod batch;
pub mod config;
