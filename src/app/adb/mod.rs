pub mod bridge;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod runner;
