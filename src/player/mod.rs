// 播放器核心模块

pub mod queue;
pub mod buffer;
pub mod demuxer_source; // Demuxer 抽象接口
pub mod demuxer;        // MPEG-PS 解复用器
pub mod codec;
#[cfg(feature = "ffmpeg")]
pub mod decoder;        // libavcodec 编解码器
pub mod colorspace;
pub mod output;
#[cfg(feature = "audio")]
pub mod audio_output;   // cpal 声卡输出
pub mod stream;
pub mod input;
pub mod registry;
pub mod engine;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Engine, EngineEvent};
pub use registry::ModuleRegistry;
pub use demuxer::MpegDemuxer;
pub use output::{FileOutput, NullOutput, OutputKind};
