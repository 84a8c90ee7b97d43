#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod health;
pub mod hub;
pub mod registry;
pub mod store;
pub mod transport;
