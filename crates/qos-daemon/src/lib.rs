//! Slice QoS daemon: controller and node roles over HTTP

pub mod api;
pub mod config;
pub mod node_api;
