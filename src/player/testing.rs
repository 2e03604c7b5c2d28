//! 单元测试共用的码流构造器和假模块

use crate::core::{
    AudioFrame, CodecErrorCode, CodecId, ErrorDomain, Frame, MediaType, Packet, PixelFormat,
    RawFrame, Result, SampleFormat, StreamInfo, StreamProperties, SubtitleFrame, VideoFrame,
};
use crate::engine_error;
use crate::player::buffer::{ByteBuffer, ReaderSource};
use crate::player::codec::Codec;
use crate::player::colorspace::{Colorspace, SoftwareColorspace};
use crate::player::demuxer::MpegDemuxer;
use crate::player::demuxer_source::{ContainerFormat, DemuxerSource};
use crate::player::input::Input;
use crate::player::output::{NullOutput, Output, OutputKind};
use crate::player::queue::BlockingQueue;
use crate::player::registry::ModuleRegistry;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::Arc;

/// 按 PES 时间戳字段的位布局编码 33 位时间戳
pub fn encode_timestamp(marker: u8, ts: i64) -> [u8; 5] {
    [
        (marker << 4) | ((((ts >> 30) & 0x7) as u8) << 1) | 1,
        ((ts >> 22) & 0xFF) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
        ((ts >> 7) & 0xFF) as u8,
        (((ts & 0x7F) as u8) << 1) | 1,
    ]
}

/// MPEG-2 pack header（不带填充）
pub fn pack_header() -> Vec<u8> {
    vec![0x00, 0x00, 0x01, 0xBA, 0x44, 0x00, 0x04, 0x00, 0x04, 0x01, 0x01, 0x89, 0xC3, 0xF8]
}

pub fn system_header() -> Vec<u8> {
    vec![
        0x00, 0x00, 0x01, 0xBB, 0x00, 0x0C, 0x80, 0x00, 0x01, 0x04, 0xE1, 0xFF, 0xE0, 0xE0, 0x00,
        0xC0, 0xC0, 0x20,
    ]
}

fn pes(stream_id: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, stream_id];
    out.extend((body.len() as u16).to_be_bytes());
    out.extend(body);
    out
}

fn mpeg2_header(ts: Option<(i64, i64)>) -> Vec<u8> {
    match ts {
        None => vec![0x80, 0x00, 0x00],
        Some((pts, dts)) if pts == dts => {
            let mut header = vec![0x80, 0x80, 5];
            header.extend(encode_timestamp(0x2, pts));
            header
        }
        Some((pts, dts)) => {
            let mut header = vec![0x80, 0xC0, 10];
            header.extend(encode_timestamp(0x3, pts));
            header.extend(encode_timestamp(0x1, dts));
            header
        }
    }
}

/// MPEG-2 PES；`ts` 为 (pts, dts)，两者相等时只写 PTS
pub fn pes_mpeg2(stream_id: u8, ts: Option<(i64, i64)>, payload: &[u8]) -> Vec<u8> {
    let mut body = mpeg2_header(ts);
    body.extend_from_slice(payload);
    pes(stream_id, body)
}

/// 私有流 1（0xBD），音频子流带上 DVD 音频头
pub fn pes_private(substream: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = mpeg2_header(None);
    body.push(substream);
    match substream {
        0xB0..=0xBF => body.extend([0x01, 0x00, 0x01, 0x00]),
        0x80..=0xCF => body.extend([0x01, 0x00, 0x01]),
        _ => {}
    }
    body.extend_from_slice(payload);
    pes(0xBD, body)
}

/// MPEG-1 PES：两个填充字节，可选 STD 字段和 PTS
pub fn pes_mpeg1(stream_id: u8, pts: Option<i64>, std: bool, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![0xFF, 0xFF];
    if std {
        body.extend([0x40, 0x00]);
    }
    match pts {
        Some(pts) => body.extend(encode_timestamp(0x2, pts)),
        None => body.push(0x0F),
    }
    body.extend_from_slice(payload);
    pes(stream_id, body)
}

/// 从内存读取的输入（协议 "memory"）
pub struct MemoryInput {
    data: Vec<u8>,
}

impl MemoryInput {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Input for MemoryInput {
    fn protocol(&self) -> &str {
        "memory"
    }

    fn open(&mut self, _uri: &str, buffer_size: usize) -> Result<ByteBuffer> {
        Ok(ByteBuffer::new(
            ReaderSource::new(Cursor::new(self.data.clone())),
            buffer_size,
        ))
    }

    fn close(&mut self) {}
}

pub const SCRIPTED_VIDEO_SIZE: u32 = 16;

/// 可控的假编解码器
///
/// 每个包切成一帧。解码时看负载的第一个字节：
/// - 0xEE：返回解码错误
/// - 0xDD：没有输出
/// - 0xCC：生成的帧留在编解码器里，直到 flush
/// - 其它：按媒体类型生成一帧
pub struct ScriptedCodec {
    id: CodecId,
    /// 前几次 parse 之后视频尺寸仍报告为 0x0
    unsized_parses: u32,
    parses: u32,
    held: Vec<Frame>,
}

impl ScriptedCodec {
    pub fn new(id: CodecId) -> Self {
        Self::with_unsized_parses(id, 0)
    }

    pub fn with_unsized_parses(id: CodecId, unsized_parses: u32) -> Self {
        Self {
            id,
            unsized_parses,
            parses: 0,
            held: Vec::new(),
        }
    }

    pub fn properties_for(id: CodecId) -> StreamProperties {
        match id.media_type() {
            MediaType::Audio => StreamProperties {
                channels: 2,
                sample_rate: 48_000,
                sample_format: SampleFormat::S16,
                ..Default::default()
            },
            MediaType::Video => StreamProperties {
                width: SCRIPTED_VIDEO_SIZE,
                height: SCRIPTED_VIDEO_SIZE,
                pixel_format: PixelFormat::Yuv420p,
                ..Default::default()
            },
            _ => StreamProperties::default(),
        }
    }
}

impl Codec for ScriptedCodec {
    fn id(&self) -> CodecId {
        self.id
    }

    fn parse(&mut self, packet: &Packet, frames: &BlockingQueue<RawFrame>) -> Result<()> {
        self.parses += 1;
        frames
            .try_enqueue(RawFrame {
                stream_id: packet.stream_id,
                data: packet.data.clone(),
                pts: packet.pts,
                dts: packet.dts,
            })
            .map_err(|_| {
                engine_error!(ErrorDomain::Codec, CodecErrorCode::Failed, "codec-scripted", "帧队列已关闭")
            })
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<Option<Frame>> {
        match frame.data.first() {
            Some(0xEE) => {
                return Err(engine_error!(
                    ErrorDomain::Codec,
                    CodecErrorCode::Failed,
                    "codec-scripted",
                    "scripted failure at pts {}",
                    frame.pts
                ))
            }
            Some(0xDD) => return Ok(None),
            _ => {}
        }
        let held = frame.data.first() == Some(&0xCC);

        let decoded = match self.id.media_type() {
            MediaType::Audio => Frame::Audio(AudioFrame {
                data: frame.data.clone(),
            }),
            MediaType::Video => {
                let mut video =
                    VideoFrame::alloc(SCRIPTED_VIDEO_SIZE, SCRIPTED_VIDEO_SIZE, PixelFormat::Yuv420p);
                video.data[0].fill(frame.data.first().copied().unwrap_or(0));
                Frame::Video(video)
            }
            _ => Frame::Subtitle(SubtitleFrame {
                x: 2,
                y: 3,
                width: 4,
                height: 2,
                format: PixelFormat::Rgb32,
                data: [vec![0xFF; 4 * 4 * 2], Vec::new(), Vec::new(), Vec::new()],
                linesize: [16, 0, 0, 0],
            }),
        };
        if held {
            self.held.push(decoded);
            return Ok(None);
        }
        Ok(Some(decoded))
    }

    fn flush(&mut self) -> Result<Vec<Frame>> {
        Ok(std::mem::take(&mut self.held))
    }

    fn properties(&self) -> StreamProperties {
        let mut properties = Self::properties_for(self.id);
        if self.unsized_parses > 0 && self.parses <= self.unsized_parses {
            properties.width = 0;
            properties.height = 0;
        }
        properties
    }
}

/// 记录到的输出调用
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Opened(OutputKind, StreamInfo),
    Frame(OutputKind, Frame),
    Overlay(Frame),
    Closed(OutputKind),
}

pub type OutputLog = Arc<Mutex<Vec<OutputEvent>>>;

/// 把所有调用记录到共享日志的输出
pub struct RecordingOutput {
    kind: OutputKind,
    log: OutputLog,
}

impl RecordingOutput {
    pub fn new(kind: OutputKind, log: OutputLog) -> Self {
        Self { kind, log }
    }
}

impl Output for RecordingOutput {
    fn open(&mut self, stream: &StreamInfo) -> Result<()> {
        self.log.lock().push(OutputEvent::Opened(self.kind, stream.clone()));
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.log.lock().push(OutputEvent::Frame(self.kind, frame.clone()));
        Ok(())
    }

    fn write_overlay(&mut self, frame: &Frame) -> Result<()> {
        self.log.lock().push(OutputEvent::Overlay(frame.clone()));
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().push(OutputEvent::Closed(self.kind));
    }

    fn description(&self) -> String {
        format!("recording {:?} output", self.kind)
    }
}

fn base_registry(data: Vec<u8>, unsized_parses: u32) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register_input("memory", move || -> Box<dyn Input> {
        Box::new(MemoryInput::new(data.clone()))
    });
    registry.register_demuxer(ContainerFormat::MpegProgramStream, || -> Box<dyn DemuxerSource> {
        Box::new(MpegDemuxer::new())
    });
    // AC3 故意不注册
    for id in [CodecId::Mpeg2Video, CodecId::Mp3, CodecId::DvdSubpicture] {
        registry.register_codec(id, move |id| -> Result<Box<dyn Codec>> {
            Ok(Box::new(ScriptedCodec::with_unsized_parses(id, unsized_parses)))
        });
    }
    registry.set_colorspace(|key| -> Result<Box<dyn Colorspace>> {
        Ok(Box::new(SoftwareColorspace::new(key)?))
    });
    registry
}

/// 内存输入 + MPEG 解复用器 + 假编解码器 + 空输出
pub fn test_registry(data: Vec<u8>) -> ModuleRegistry {
    let mut registry = base_registry(data, 0);
    for kind in [OutputKind::Audio, OutputKind::Video] {
        registry.register_output(kind, move || -> Result<Box<dyn Output>> {
            Ok(Box::new(NullOutput::new(kind)))
        });
    }
    registry
}

/// 同 [`test_registry`]，但输出调用记录到返回的日志中
pub fn recording_registry(data: Vec<u8>) -> (ModuleRegistry, OutputLog) {
    late_size_registry(data, 0)
}

/// 同 [`recording_registry`]，视频编解码器在前 `unsized_parses` 次 parse 后才报告尺寸
pub fn late_size_registry(data: Vec<u8>, unsized_parses: u32) -> (ModuleRegistry, OutputLog) {
    let mut registry = base_registry(data, unsized_parses);
    let log: OutputLog = Arc::default();
    for kind in [OutputKind::Audio, OutputKind::Video] {
        let log = log.clone();
        registry.register_output(kind, move || -> Result<Box<dyn Output>> {
            Ok(Box::new(RecordingOutput::new(kind, log.clone())))
        });
    }
    (registry, log)
}
