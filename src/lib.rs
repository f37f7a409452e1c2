// src/lib.rs
pub mod backends;
pub mod banner;
pub mod config;
pub mod errors;
pub mod models;
pub mod poller;
pub mod progress;
pub mod runner;
