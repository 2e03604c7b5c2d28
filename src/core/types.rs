use serde::{Deserialize, Serialize};

/// 编码类型（由 PES 流 ID 推断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    Mpeg2Video,
    Mp3,
    Ac3,
    Dts,
    DvdSubpicture,
    Unknown,
}

impl CodecId {
    /// 根据流 ID（PES start code 或 private stream 1 子流 ID）分类
    pub fn from_stream_id(id: u32) -> Self {
        match id {
            0x1C0..=0x1DF => CodecId::Mp3,
            0x1E0..=0x1EF => CodecId::Mpeg2Video,
            0x80..=0x87 | 0xC0..=0xCF => CodecId::Ac3,
            0x88..=0x8F | 0x98..=0x9F => CodecId::Dts,
            0x20..=0x3F => CodecId::DvdSubpicture,
            _ => CodecId::Unknown,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            CodecId::Mpeg2Video => MediaType::Video,
            CodecId::Mp3 | CodecId::Ac3 | CodecId::Dts => MediaType::Audio,
            CodecId::DvdSubpicture => MediaType::Subtitle,
            CodecId::Unknown => MediaType::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CodecId::Mpeg2Video => "MPEG-2 Video",
            CodecId::Mp3 => "MPEG-1 Audio Layer 3 (MP3)",
            CodecId::Ac3 => "ATSC A/52a (Dolby Digital AC3)",
            CodecId::Dts => "DTS Coherent Acoustics",
            CodecId::DvdSubpicture => "DVD Subpicture",
            CodecId::Unknown => "Unknown",
        }
    }
}

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Subtitle,
    Unknown,
}

/// 像素格式
///
/// `Rgb32` 为小端 32 位打包格式，内存中的字节顺序为 B, G, R, A。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Unknown,
    Yuv420p,
    Rgb32,
}

impl PixelFormat {
    /// 每个平面的 (宽度除数, 高度除数, 每像素字节数)，未使用的平面为 None
    pub fn plane_layout(&self) -> [Option<(u32, u32, usize)>; 4] {
        match self {
            PixelFormat::Yuv420p => [Some((1, 1, 1)), Some((2, 2, 1)), Some((2, 2, 1)), None],
            PixelFormat::Rgb32 => [Some((1, 1, 4)), None, None, None],
            PixelFormat::Unknown => [None, None, None, None],
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    Unknown,
    /// 有符号 16 位，交错存放
    S16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::Unknown => 0,
        }
    }
}

/// 解复用得到的 PES 负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: u32,
    pub codec: CodecId,
    pub data: Vec<u8>,
    pub pts: i64, // 90 kHz
    pub dts: i64,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 已切分但尚未解码的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub stream_id: u32,
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
}

/// 解码后的 PCM 数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

/// 解码后的平面图像（平面数据归帧所有，解码时已从解码器内部缓冲区拷出）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: [Vec<u8>; 4],
    pub linesize: [usize; 4],
}

impl VideoFrame {
    /// 按格式分配紧凑排列（linesize == 行字节数）的空白帧
    pub fn alloc(width: u32, height: u32, format: PixelFormat) -> Self {
        let mut data: [Vec<u8>; 4] = Default::default();
        let mut linesize = [0usize; 4];
        for (i, layout) in format.plane_layout().iter().enumerate() {
            if let Some((wdiv, hdiv, bpp)) = layout {
                let stride = width.div_ceil(*wdiv) as usize * bpp;
                let rows = height.div_ceil(*hdiv) as usize;
                linesize[i] = stride;
                data[i] = vec![0; stride * rows];
            }
        }
        Self {
            width,
            height,
            format,
            data,
            linesize,
        }
    }
}

/// 解码后的字幕区域
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleFrame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: [Vec<u8>; 4],
    pub linesize: [usize; 4],
}

/// 帧（四种变体之一）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Raw(RawFrame),
    Audio(AudioFrame),
    Video(VideoFrame),
    Subtitle(SubtitleFrame),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Raw(_) => "raw",
            Frame::Audio(_) => "audio",
            Frame::Video(_) => "video",
            Frame::Subtitle(_) => "subtitle",
        }
    }
}

/// 流属性（由编解码器提供）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProperties {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl Default for StreamProperties {
    fn default() -> Self {
        Self {
            channels: 0,
            sample_rate: 0,
            sample_format: SampleFormat::Unknown,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Unknown,
        }
    }
}

impl StreamProperties {
    /// 属性是否足以打开输出（视频需要尺寸，音频需要声道数和采样率）
    pub fn is_usable(&self, media: MediaType) -> bool {
        match media {
            MediaType::Video => self.width > 0 && self.height > 0,
            MediaType::Audio => self.channels > 0 && self.sample_rate > 0,
            MediaType::Subtitle | MediaType::Unknown => true,
        }
    }
}

/// 流信息快照（用于输出设备和事件）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: u32,
    pub codec: CodecId,
    pub media_type: MediaType,
    pub properties: StreamProperties,
    /// 是否成为该媒体类型的活动流
    pub active: bool,
}

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Created,
    Opened,
    Playing,
    Closed,
}

/// 运行统计（用于监控和调试）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// 路由到各工作线程的帧数
    pub audio_routed: u64,
    pub video_routed: u64,
    pub subtitle_routed: u64,

    /// 不属于任何活动流而被丢弃的帧
    pub dropped: u64,

    /// 成功写到输出的帧数
    pub audio_presented: u64,
    pub video_presented: u64,
    pub subtitle_presented: u64,

    /// 被跳过的可恢复错误
    pub recoverable_errors: u64,

    /// 事件通道已满而丢弃的事件
    pub events_dropped: u64,
}
