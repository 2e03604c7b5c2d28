//! 模块化媒体播放引擎：MPEG-PS 解复用 + 多线程解码管线

pub mod core;
pub mod player;

pub use crate::core::{EngineConfig, EngineError, Result};
pub use crate::player::{Engine, EngineEvent, ModuleRegistry};
