//! Muster CLI library: command implementations shared by the `muster`
//! binary and its integration tests.

pub mod commands;
