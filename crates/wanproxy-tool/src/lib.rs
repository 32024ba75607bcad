#![warn(missing_docs)]

//! WANProxy tooling: the `xcodec-tool` command line over the codec and transport crates

pub mod cli;
pub mod config;

pub use config::ToolConfig;
