pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod jobs;
pub mod message;
pub mod rebalance;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod test_utils;
pub mod transport;
