//! MCP Studio Core - platform-independent building blocks
//!
//! Error taxonomy, configuration, flow and event models, output line capture
//! and the process traits implemented by the platform crates.

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod lines;
pub mod process;

pub use command::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use flow::*;
pub use lines::*;
pub use process::*;
