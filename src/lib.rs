pub mod broker;
pub mod config;
pub mod consumer;
pub mod features;
pub mod health;
pub mod inference;
pub mod model_sync;
pub mod producer;
pub mod scheduler;
pub mod subject;
pub mod telemetry;
