pub mod auth;
pub mod conf;
pub mod data;
pub mod docs;
pub mod quota;
pub mod server;
pub mod tracing;
pub mod types;
