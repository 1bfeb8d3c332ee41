pub mod adb;
pub mod build;
pub mod checks;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod models;
pub mod perf;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod stage;

#[cfg(test)]
pub mod test_support;
