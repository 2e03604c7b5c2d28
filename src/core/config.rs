use crate::core::types::PixelFormat;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 指定配置文件路径的环境变量
pub const CONFIG_ENV: &str = "MYY_ENGINE_CONFIG";

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 每种媒体类型的帧队列容量
    pub queue_capacity: usize,
    /// 输入读缓冲区大小（字节）
    pub read_buffer_size: usize,
    /// 视频输出的目标像素格式
    pub video_pixel_format: PixelFormat,
    /// 是否按 PTS 节奏呈现视频帧
    pub pace_video: bool,
    /// 延迟低于该值（毫秒）时不休眠
    pub pace_threshold_ms: u64,
    /// 单帧最长休眠（毫秒），防止错误的时间戳卡住线程
    pub max_pace_ms: u64,
    /// 连续损坏的 PES 超过该数目时放弃整个输入
    pub max_consecutive_corruptions: u32,
    /// 事件通道容量，通道满时新事件被丢弃并计数
    pub event_capacity: usize,
    /// 命令行播放窗口（秒）
    pub play_seconds: u64,
    /// 视频原始数据转储文件，None 时使用空输出
    pub video_dump: Option<PathBuf>,
    /// 音频 PCM 转储文件
    pub audio_dump: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            read_buffer_size: 2048,
            video_pixel_format: PixelFormat::Yuv420p,
            pace_video: true,
            pace_threshold_ms: 10,
            max_pace_ms: 1000,
            max_consecutive_corruptions: 16,
            event_capacity: 256,
            play_seconds: 3,
            video_dump: None,
            audio_dump: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(content).context("配置解析失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        Self::from_json_str(&content)
    }

    /// 若设置了环境变量则从文件加载，否则使用默认配置
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_json_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity 必须大于 0");
        }
        if self.event_capacity == 0 {
            anyhow::bail!("event_capacity 必须大于 0");
        }
        if self.read_buffer_size == 0 {
            anyhow::bail!("read_buffer_size 必须大于 0");
        }
        if self.video_pixel_format == PixelFormat::Unknown {
            anyhow::bail!("video_pixel_format 不能为 Unknown");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.video_pixel_format, PixelFormat::Yuv420p);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "queue_capacity": 4, "pace_video": false }"#).unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert!(!config.pace_video);
        assert_eq!(config.max_consecutive_corruptions, 16);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.video_dump, None);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(EngineConfig::from_json_str(r#"{ "queue_capacity": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{ "event_capacity": 0 }"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_round_trip_through_serde() {
        let mut config = EngineConfig::default();
        config.video_dump = Some(PathBuf::from("/tmp/video.yuv"));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }
}
