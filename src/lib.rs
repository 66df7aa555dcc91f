//! Collaboration and state-sync core for multi-client visualization sessions.

pub mod client;
pub mod collaboration;
pub mod config;
pub mod events;
pub mod idmap;
pub mod insitu;
pub mod link;
pub mod message;
pub mod proxy;
pub mod relay;
pub mod remote;
pub mod render;
pub mod replication;
pub mod scene;
pub mod session;

#[cfg(test)]
mod test_support;
