//! nodeprof: drains a kernel-populated, time-bucketed counter table and
//! republishes each closed bucket as a labelled metrics snapshot.

pub mod agent;
pub mod clock;
pub mod config;
pub mod drain;
pub mod export;
pub mod report;
pub mod sink;
pub mod table;
pub mod tracer;
