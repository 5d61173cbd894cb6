//! Kiwi agent library: the reconciliation engine and its collaborators.
//! The `kiwi` binary (`src/main.rs`) is a thin bootstrap over this crate;
//! everything here is also exercised directly by `tests/integration.rs`.

#![warn(missing_docs)]

pub mod addresswatcher;
pub mod config;
pub mod coordination;
pub mod firewall;
pub mod interface;
pub mod manager;
pub mod servicewatcher;
