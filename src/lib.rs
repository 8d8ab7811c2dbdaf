pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod housekeeping;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod sweeper;
pub mod wal;
