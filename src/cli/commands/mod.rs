pub mod chat;
pub mod classify;
pub mod config;
pub mod metrics;
