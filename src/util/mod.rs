// Shared utilities for the pipeline and the inventory tool

pub mod cmd;
pub mod fs;
pub mod macros;
