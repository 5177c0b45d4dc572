//! Core crate for the upscaler ExApp: host protocol, restoration jobs and HTTP front end.

pub mod config;
pub mod host;
pub mod job;
pub mod logging;
pub mod model_registry;
pub mod restore;
pub mod runtime;
pub mod server;
pub mod signing;
pub mod types;
pub mod worker;
