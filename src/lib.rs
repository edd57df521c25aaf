pub mod api;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod tasks;
pub mod worker;
