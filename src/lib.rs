pub mod assets;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod http;
pub mod model;
pub mod observability;
pub mod proxy;
pub mod sinks;
