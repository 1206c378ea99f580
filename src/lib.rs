pub mod artifacts;
pub mod cmd;
pub mod config;
pub mod cookies;
pub mod download;
mod error;
pub mod events;
pub mod ffmpeg;
pub mod join;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod rename;
pub mod supervisor;
pub mod tags;
pub mod toolchain;
pub mod tools;
pub mod tracks;

pub use error::{EngineError, JoinStage, Result};
