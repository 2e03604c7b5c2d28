use crate::core::{CodecId, Frame, Packet, RawFrame, Result, StreamProperties};
use crate::player::queue::BlockingQueue;

/// 编解码器抽象接口
///
/// 每条基本流一个实例。`parse` 在路由线程中调用，把 PES 负载拼接成完整的帧；
/// `decode` 在对应媒体类型的工作线程中调用。两者由 [`Stream`](crate::player::stream::Stream)
/// 的锁串行化。
pub trait Codec: Send {
    fn id(&self) -> CodecId;

    /// 消费一个包，把切分出的完整帧放入 `frames`（可能 0 个或多个）
    fn parse(&mut self, packet: &Packet, frames: &BlockingQueue<RawFrame>) -> Result<()>;

    /// 解码一帧；Ok(None) 表示暂时没有可呈现的输出
    fn decode(&mut self, frame: &RawFrame) -> Result<Option<Frame>>;

    /// 流结束时取出编解码器内部还缓存着的帧
    fn flush(&mut self) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }

    /// 当前已知的流属性
    fn properties(&self) -> StreamProperties;
}
