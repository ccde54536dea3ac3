pub mod awaiting_tasks;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod handlers;
pub mod join_barrier;
pub mod listener;
pub mod outcome;
pub mod output_store;
pub mod readiness;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;
