pub mod config;
pub mod stats;
