#[path = "../common/mod.rs"]
mod common;

mod cli_tests;
mod lifecycle_tests;
mod listener_tests;
mod remote_wait_tests;
