//! HTTP surface of the relay.

pub mod client;
pub mod health;
pub mod request_id;
pub mod user;
