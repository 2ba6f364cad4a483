#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_path_absent};
pub use fixtures::{TestProject, run};
pub use logging::init_test_logging;
