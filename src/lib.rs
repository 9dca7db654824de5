#![forbid(unsafe_code)]

pub mod aggregate;
pub mod analyze;
pub mod cache;
pub mod chunk;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod llm;
pub mod logging;
pub mod model;
pub mod prompt;
pub mod ratelimit;
pub mod response;
pub mod retry;
pub mod robots;
pub mod server;
pub mod usage;
pub mod validate;
