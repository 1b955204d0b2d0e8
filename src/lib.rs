pub mod batch;
pub mod brightdata;
pub mod config;
pub mod database;
pub mod dataforseo;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod openai;
pub mod queue;
pub mod retry;
pub mod sanitize;
pub mod scheduler;
pub mod selector;
pub mod submission;
pub mod urls;
pub mod volume;
pub mod web;

pub use config::Settings;
pub use error::{Error, Result};
