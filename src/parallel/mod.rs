//! Unit scheduling and parallel fan-out.

mod scheduler;
mod unit;

pub use scheduler::{FanOutPlan, ParallelRunner};
pub use unit::UnitScheduler;
