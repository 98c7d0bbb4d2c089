//! Scheduled and on-demand polling sweeps that pull document status from the
//! registry for invoices still in flight.

pub mod service;

pub use service::{PollingSweep, SweepConfig, SweepError, SweepSummary};
