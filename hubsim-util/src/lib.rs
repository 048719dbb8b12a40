pub mod config;
pub mod crypto;
pub mod dirs;
pub mod fs;
pub mod logging;
pub mod store;
pub mod types;
