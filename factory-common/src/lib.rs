pub mod dedup;
pub mod event;
pub mod metrics;
pub mod reconcile;
pub mod service;
pub mod stats;
pub mod store;
pub mod time;
pub mod timestamp;
pub mod top_lines;
pub mod validation;
