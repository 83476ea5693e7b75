pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod master_impl;
pub mod master_service;
pub mod node_impl;
pub mod node_service;
pub mod protocol;
pub mod stats;
