// Claim-and-dispatch loop over the job store

pub mod engine;

pub use engine::SchedulerEngine;
