//! chv CLI - client and server front end for the VM manager.

pub mod client;
pub mod commands;
pub mod output;
