pub mod config;
pub mod endpoint;
pub mod frame;
