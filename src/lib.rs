pub mod cache;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod violation;
pub mod wal;
pub mod wire;
