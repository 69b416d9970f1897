//! tsnodectl: bring single-instance VPN relay nodes up and down.
//!
//! The binary in `main.rs` is a thin clap surface over the command modules
//! here; everything that writes to the terminal takes a writer so it can be
//! tested.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod layout;
pub mod node_cmd;
pub mod state_cmd;

pub use config::CliConfig;
pub use error::{CliError, CliResult};
pub use layout::Layout;
pub use node_cmd::{Context, UpArgs};
