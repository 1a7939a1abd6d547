pub mod analysis;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod host;
pub mod mailbox;
pub mod mcp;
pub mod monitor;
pub mod runner;
pub mod tools;
pub mod upload;
