use crate::core::{Packet, Result};
use crate::player::buffer::ByteBuffer;

/// 容器格式（用于在注册表中查找解复用器）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// MPEG-1/2 Program Stream
    MpegProgramStream,
}

/// Demuxer 抽象接口
///
/// 解复用器持有输入层交给它的 [`ByteBuffer`]，每次调用 `read_packet` 产生一个 PES 负载。
pub trait DemuxerSource: Send {
    /// 接管字节缓冲区
    fn open(&mut self, buffer: ByteBuffer) -> Result<()>;

    /// 读取下一个媒体包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达流末尾
    /// - Err(e): 当前包损坏或读取失败，调用方决定是否继续
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// 底层缓冲区是否已到达末尾
    fn is_eos(&self) -> bool;

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
