pub mod collector;
pub mod connections;
pub mod host;
pub mod platform;
pub mod snapshot;
