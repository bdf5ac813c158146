pub mod aggregate;
pub mod cli;
pub mod collect;
pub mod config;
pub mod pipeline;
pub mod plugin;
pub mod source;
pub mod storage;
pub mod upload;
