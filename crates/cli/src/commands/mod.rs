//! Command implementations
//!
//! Each subcommand lives in its own module.

pub mod deregister;
pub mod list;
pub mod register;
pub mod run;
