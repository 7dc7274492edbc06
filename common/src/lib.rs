// Common library shared by the scheduler daemon and the test suites

pub mod batch;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod window;
