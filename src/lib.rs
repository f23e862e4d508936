pub mod config;
pub mod export;
pub mod rpc;
pub mod stats;
pub mod tag;
