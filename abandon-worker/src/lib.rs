pub mod cache;
pub mod classifier;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod ingestor;
pub mod lookup;
pub mod metrics_consts;
pub mod resolver;
pub mod store;
