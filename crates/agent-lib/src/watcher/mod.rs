//! Watchers and the monitor that runs them

mod monitor;
mod task;

pub use monitor::{Monitor, MonitorBuilder};
pub use task::{BaselinePolicy, TickOutcome, Watcher, WatcherSpec, WatcherState};
