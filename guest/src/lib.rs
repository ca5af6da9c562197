//! Guest side of the ESN async page-fault protocol.
//!
//! A thread faulting on an expropriated page parks in the [`Parker`] until
//! the [`Dispatcher`], run from the subvention interrupt, finds its token on
//! the notification ring and wakes it.

mod apf;
pub mod cpu;
mod dispatcher;
mod error;
mod hcall;
mod parker;
mod stats;
pub mod waiters;

pub use apf::{GuestApf, GuestConfig};
pub use cpu::{GuestCpu, ThreadCpu};
pub use dispatcher::Dispatcher;
pub use error::GuestError;
pub use hcall::SnsVeneer;
pub use parker::{ParkOutcome, Parker};
pub use stats::{GuestStats, GuestStatsSnapshot};
pub use waiters::{EntryKind, WaiterTable, WakeOutcome};
