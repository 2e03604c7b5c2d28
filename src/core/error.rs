use serde::Serialize;
use std::io;
use thiserror::Error;

/// 错误所属领域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorDomain {
    Memory,
    Modules,
    Engine,
    Input,
    Demuxer,
    Codec,
    Colorspace,
    Output,
}

impl ErrorDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorDomain::Memory => "memory",
            ErrorDomain::Modules => "modules",
            ErrorDomain::Engine => "engine",
            ErrorDomain::Input => "input",
            ErrorDomain::Demuxer => "demuxer",
            ErrorDomain::Codec => "codec",
            ErrorDomain::Colorspace => "colorspace",
            ErrorDomain::Output => "output",
        }
    }
}

/// 模块查找失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulesErrorCode {
    NoProtocol = 1,
    NoOutput,
    NoDemuxer,
    NoCodec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxerErrorCode {
    /// 头部声明的长度超出了 PES 包长度
    Corrupted = 1,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorCode {
    /// 在错误的状态下调用（例如未 open 就 play）
    InvalidState = 1,
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorCode {
    Failed = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorspaceErrorCode {
    Unsupported = 1,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputErrorCode {
    Failed = 1,
}

const EIO: i32 = 5;

/// 引擎统一错误
///
/// - domain: 错误领域
/// - code: 领域内错误码，系统错误为取负的 errno（避免与自定义错误码冲突）
/// - module: 产生错误的模块名（如 "demuxer-mpeg"、"input-file"）
/// - message: 格式化后的错误描述
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{module}: {message}")]
pub struct EngineError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub module: String,
    pub message: String,
}

impl EngineError {
    pub fn new(
        domain: ErrorDomain,
        code: i32,
        module: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            code,
            module: module.into(),
            message: message.into(),
        }
    }

    /// 包装系统 IO 错误，错误码取负的 errno
    pub fn from_io(module: impl Into<String>, err: &io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(EIO);
        Self::new(ErrorDomain::Input, -errno, module, err.to_string())
    }

    /// 是否为 PES 损坏错误（可跳过继续解复用）
    pub fn is_corruption(&self) -> bool {
        self.domain == ErrorDomain::Demuxer && self.code == DemuxerErrorCode::Corrupted as i32
    }

    /// 致命错误会终止遇到它的线程；其余错误只跳过当前单元
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.domain,
            ErrorDomain::Memory | ErrorDomain::Modules | ErrorDomain::Engine | ErrorDomain::Input
        )
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::from_io("input", &err)
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for EngineError {
    fn from(err: ffmpeg_next::Error) -> Self {
        let code: i32 = err.into();
        Self::new(ErrorDomain::Codec, code, "codec-libavcodec", err.to_string())
    }
}

/// 以 printf 风格构造 [`EngineError`]
///
/// ```ignore
/// engine_error!(ErrorDomain::Demuxer, DemuxerErrorCode::Corrupted, "demuxer-mpeg", "header length {} > {}", a, b)
/// ```
#[macro_export]
macro_rules! engine_error {
    ($domain:expr, $code:expr, $module:expr, $($arg:tt)+) => {
        $crate::core::error::EngineError::new($domain, ($code) as i32, $module, format!($($arg)+))
    };
}

pub type Result<T> = std::result::Result<T, EngineError>;
