//! Client configuration.

pub mod config;


pub use config::ClientConfig;
