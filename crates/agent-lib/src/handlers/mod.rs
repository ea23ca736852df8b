//! Bus subscribers shipped with the monitor

mod console;
mod event_log;
mod investigation;

pub use console::ConsolePresenter;
pub use event_log::EventLogHandler;
pub use investigation::InvestigationHandler;
