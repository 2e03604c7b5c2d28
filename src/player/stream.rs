use crate::core::{CodecId, Frame, MediaType, Packet, RawFrame, Result, StreamInfo, StreamProperties};
use crate::player::codec::Codec;
use crate::player::queue::BlockingQueue;
use parking_lot::{Mutex, RwLock};

/// 一条基本流
///
/// 第一次见到某个流 ID 时创建，生命周期持续到输入关闭。编解码器在路由线程（parse）
/// 和工作线程（decode）之间共享，用互斥锁保护。
pub struct Stream {
    id: u32,
    codec_id: CodecId,
    codec: Mutex<Box<dyn Codec>>,
    properties: RwLock<StreamProperties>,
}

impl Stream {
    pub fn new(id: u32, codec: Box<dyn Codec>) -> Self {
        let codec_id = codec.id();
        let properties = codec.properties();
        Self {
            id,
            codec_id,
            codec: Mutex::new(codec),
            properties: RwLock::new(properties),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn codec_id(&self) -> CodecId {
        self.codec_id
    }

    pub fn media_type(&self) -> MediaType {
        self.codec_id.media_type()
    }

    pub fn parse(&self, packet: &Packet, frames: &BlockingQueue<RawFrame>) -> Result<()> {
        self.codec.lock().parse(packet, frames)
    }

    pub fn decode(&self, frame: &RawFrame) -> Result<Option<Frame>> {
        self.codec.lock().decode(frame)
    }

    pub fn flush(&self) -> Result<Vec<Frame>> {
        self.codec.lock().flush()
    }

    /// 从编解码器刷新属性快照
    pub fn load_properties(&self) -> StreamProperties {
        let properties = self.codec.lock().properties();
        *self.properties.write() = properties;
        properties
    }

    pub fn properties(&self) -> StreamProperties {
        *self.properties.read()
    }

    pub fn info(&self, active: bool) -> StreamInfo {
        StreamInfo {
            id: self.id,
            codec: self.codec_id,
            media_type: self.media_type(),
            properties: self.properties(),
            active,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("codec", &self.codec_id)
            .field("properties", &self.properties())
            .finish()
    }
}
