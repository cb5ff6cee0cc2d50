pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod output;
pub mod reconcile;
pub mod report;
pub mod session;
pub mod status;
pub mod store;
pub mod transition;
