pub mod api;
pub mod batch_fetcher;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod reconcile;
pub mod tools;
pub mod validation;
