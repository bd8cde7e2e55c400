// Adapted from nextest-runner's `time` module: a monotonic stopwatch for
// elapsed-time accounting plus a pausable sleep for timeout/interval timers
// that can be paused while a unit of work is itself paused (job-control
// stop/continue upstream; here, while a lease wait or drain grace period is
// suspended).

mod pausable_sleep;
mod stopwatch;

pub(crate) use pausable_sleep::{pausable_sleep, PausableSleep};
pub(crate) use stopwatch::{stopwatch, StopwatchSnapshot, StopwatchStart};
