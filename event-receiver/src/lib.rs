pub mod config;
pub mod connection_string;
pub mod error;
pub mod event_grid;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod processor;
