//! Command implementations behind the `capturekeep` binary

pub mod capture;
pub mod content;
pub mod logs;
pub mod process;
pub mod queue;
