pub mod config;
pub mod errors;
pub mod wait_stats;
