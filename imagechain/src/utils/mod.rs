//! Utility functions.

mod polling;

pub use polling::{poll_until, PollTimeout, DEFAULT_POLL_INTERVAL, INSTANCE_STARTUP_TIMEOUT};
