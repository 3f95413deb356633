pub mod agent;
pub mod logs;
pub mod reconciler;
pub mod runner;
pub mod schedule;

#[cfg(test)]
mod runner_test;
#[cfg(test)]
mod schedule_test;
