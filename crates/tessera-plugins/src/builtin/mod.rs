//! Reference workers compiled into the host

mod counter;
mod example;

pub use counter::{CounterData, CounterWorker};
pub use example::{DEFAULT_GREETING, ExampleWorker};
