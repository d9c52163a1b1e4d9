//! Command implementations.
//!
//! Each submodule registers its commands with the process-wide registry at
//! link time; there is no central list to edit.

pub mod admin;
pub mod data;
