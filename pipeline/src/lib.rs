pub mod analytics;
pub mod config;
pub mod db;
pub mod ingest;
pub mod market;
pub mod metrics;
pub mod pairs;
pub mod queue;
pub mod state;
pub mod worker;

pub mod error;
pub mod logger;
pub mod time;
