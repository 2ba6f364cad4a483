#![allow(dead_code)]

pub mod fixtures;
pub mod logging;

pub use fixtures::{SharedBuffer, TestProject, quiet_sinks};
pub use logging::init_test_logging;
