use crate::core::{
    CodecId, EngineConfig, EngineError, EngineErrorCode, ErrorDomain, MediaType, RawFrame, Result,
};
use crate::engine_error;
use crate::player::buffer::{ByteBuffer, SeekableSource};
use crate::player::demuxer_source::{ContainerFormat, DemuxerSource};
use crate::player::queue::BlockingQueue;
use crate::player::registry::ModuleRegistry;
use crate::player::stream::Stream;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Arc;

/// 属性一直不可用时，最多等这么多帧就通知 new_stream
const MAX_UNANNOUNCED_FRAMES: u32 = 64;

/// 输入后端（按协议注册）
pub trait Input: Send {
    fn protocol(&self) -> &str;

    /// 打开 `uri`，返回读取它的字节缓冲区
    fn open(&mut self, uri: &str, buffer_size: usize) -> Result<ByteBuffer>;

    fn close(&mut self);
}

/// 本地文件输入
pub struct FileInput {
    path: Option<String>,
}

impl FileInput {
    pub fn new() -> Self {
        Self { path: None }
    }
}

impl Default for FileInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Input for FileInput {
    fn protocol(&self) -> &str {
        "file"
    }

    fn open(&mut self, uri: &str, buffer_size: usize) -> Result<ByteBuffer> {
        let file = File::open(uri).map_err(|e| {
            let mut err = EngineError::from_io("input-file", &e);
            err.message = format!("Could not open file '{}': {}", uri, e);
            err
        })?;
        info!("📁 打开本地文件: {}", uri);
        self.path = Some(uri.to_string());
        Ok(ByteBuffer::new(SeekableSource::new(file), buffer_size))
    }

    fn close(&mut self) {
        if let Some(path) = self.path.take() {
            debug!("关闭本地文件: {}", path);
        }
    }
}

/// 输入层事件回调
pub trait InputListener {
    /// 某条流的第一帧即将交付
    fn new_stream(&mut self, stream: &Arc<Stream>);

    /// 到达流末尾（只触发一次）
    fn end_of_stream(&mut self);
}

/// 通用输入层：后端 + 解复用器 + 流表
///
/// `read_frame` 反复解复用直到编解码器切分出至少一帧。
pub struct MediaInput {
    backend: Box<dyn Input>,
    uri: String,
    registry: Arc<ModuleRegistry>,
    demuxer: Option<Box<dyn DemuxerSource>>,
    streams: HashMap<u32, Arc<Stream>>,
    /// 还没有通知过 new_stream 的流，值为属性未就绪时已交付的帧数
    pending: HashMap<u32, u32>,
    /// 编解码器创建失败的流 ID，不再重试
    rejected: HashSet<u32>,
    frames: BlockingQueue<RawFrame>,
    eos: bool,
    corruption_streak: u32,
    max_corruptions: u32,
}

impl MediaInput {
    /// 通过注册表解析协议、打开后端并创建解复用器
    pub fn open(
        registry: Arc<ModuleRegistry>,
        config: &EngineConfig,
        protocol: &str,
        uri: &str,
    ) -> Result<Self> {
        let mut backend = registry.create_input(protocol)?;
        let buffer = backend.open(uri, config.read_buffer_size)?;

        let mut demuxer = match registry.create_demuxer(ContainerFormat::MpegProgramStream) {
            Ok(demuxer) => demuxer,
            Err(e) => {
                backend.close();
                return Err(e);
            }
        };
        if let Err(e) = demuxer.open(buffer) {
            backend.close();
            return Err(e);
        }
        info!("✅ 输入已打开: {}://{} ({})", backend.protocol(), uri, demuxer.description());

        Ok(Self {
            backend,
            uri: uri.to_string(),
            registry,
            demuxer: Some(demuxer),
            streams: HashMap::new(),
            pending: HashMap::new(),
            rejected: HashSet::new(),
            frames: BlockingQueue::new(0),
            eos: false,
            corruption_streak: 0,
            max_corruptions: config.max_consecutive_corruptions,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn stream(&self, id: u32) -> Option<&Arc<Stream>> {
        self.streams.get(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// 查找流，第一次见到时通过注册表创建编解码器
    fn find_stream(&mut self, id: u32, codec: CodecId) -> Option<Arc<Stream>> {
        if let Some(stream) = self.streams.get(&id) {
            return Some(stream.clone());
        }
        if self.rejected.contains(&id) {
            return None;
        }

        match self.registry.create_codec(codec) {
            Ok(instance) => {
                let stream = Arc::new(Stream::new(id, instance));
                info!("🆕 发现新流 0x{:x}: {}", id, codec.description());
                self.streams.insert(id, stream.clone());
                self.pending.insert(id, 0);
                Some(stream)
            }
            Err(e) => {
                warn!("流 0x{:x} 无可用编解码器，丢弃其数据: {}", id, e);
                self.rejected.insert(id);
                None
            }
        }
    }

    /// 读取下一帧；Ok(None) 表示流结束
    pub fn read_frame(&mut self, listener: &mut dyn InputListener) -> Result<Option<RawFrame>> {
        while self.frames.is_empty() {
            if self.eos {
                return Ok(None);
            }

            let demuxer = self.demuxer.as_mut().ok_or_else(|| {
                engine_error!(ErrorDomain::Engine, EngineErrorCode::InvalidState, "input", "输入已关闭")
            })?;

            let packet = match demuxer.read_packet() {
                Ok(Some(packet)) => {
                    self.corruption_streak = 0;
                    packet
                }
                Ok(None) => {
                    info!("📄 输入到达流末尾: {}", self.uri);
                    self.eos = true;
                    listener.end_of_stream();
                    return Ok(None);
                }
                Err(e) if e.is_corruption() => {
                    self.corruption_streak += 1;
                    if self.corruption_streak > self.max_corruptions {
                        warn!("连续 {} 个损坏的 PES，放弃输入", self.corruption_streak);
                        return Err(e);
                    }
                    warn!("跳过损坏的 PES: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if packet.codec.media_type() == MediaType::Unknown {
                trace!("丢弃未识别的流 0x{:x} ({} 字节)", packet.stream_id, packet.len());
                continue;
            }

            let Some(stream) = self.find_stream(packet.stream_id, packet.codec) else {
                continue;
            };
            if let Err(e) = stream.parse(&packet, &self.frames) {
                warn!("流 0x{:x} 切分失败，跳过该包: {}", packet.stream_id, e);
            }
        }

        let Some(frame) = self.frames.try_dequeue() else {
            return Ok(None);
        };

        self.announce(frame.stream_id, listener);
        Ok(Some(frame))
    }

    /// 流的属性可用（或等待的帧数到达上限）后才通知 new_stream，只通知一次
    ///
    /// 属性未就绪时帧照常交付，没有激活的流的帧由调用方丢弃。
    fn announce(&mut self, id: u32, listener: &mut dyn InputListener) {
        let Some(waited) = self.pending.get_mut(&id) else {
            return;
        };
        let Some(stream) = self.streams.get(&id) else {
            return;
        };

        let properties = stream.load_properties();
        if !properties.is_usable(stream.media_type()) {
            *waited += 1;
            if *waited < MAX_UNANNOUNCED_FRAMES {
                trace!("流 0x{:x} 属性尚未就绪 ({} 帧): {:?}", id, waited, properties);
                return;
            }
            warn!("流 0x{:x} 在 {} 帧后仍没有可用属性，照常通知", id, waited);
        }

        debug!("流 0x{:x} 属性: {:?}", id, properties);
        let stream = stream.clone();
        self.pending.remove(&id);
        listener.new_stream(&stream);
    }

    /// 释放流表、解复用器（及其缓冲区）和帧队列，然后关闭后端
    pub fn close(&mut self) {
        self.streams.clear();
        self.pending.clear();
        self.demuxer = None;
        while self.frames.try_dequeue().is_some() {}
        self.backend.close();
        info!("输入已关闭: {}", self.uri);
    }
}
