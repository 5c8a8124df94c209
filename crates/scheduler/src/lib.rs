pub mod dispatcher;

pub use dispatcher::{DispatchScheduler, SchedulerConfig, TickReport};
