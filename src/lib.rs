pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod trainer;
