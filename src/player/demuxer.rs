use crate::core::{CodecId, DemuxerErrorCode, EngineError, ErrorDomain, Packet, Result};
use crate::engine_error;
use crate::player::buffer::ByteBuffer;
use crate::player::demuxer_source::DemuxerSource;
use log::{debug, info, trace};

const MODULE: &str = "demuxer-mpeg";

const PROGRAM_END_CODE: u32 = 0x1B9;
const PACK_HEADER_CODE: u32 = 0x1BA;
const SYSTEM_HEADER_CODE: u32 = 0x1BB;
const PRIVATE_STREAM_1: u32 = 0x1BD;

/// 解析 PES 33 位时间戳
///
/// `c` 为首字节（高 4 位是标记），`mid`/`low` 为随后的两个 16 位字段，
/// 各自最低位是 marker bit。
pub fn decode_timestamp(c: u8, mid: u16, low: u16) -> i64 {
    (((c & 0x0E) as i64) << 29) | (((mid >> 1) as i64) << 15) | ((low >> 1) as i64)
}

fn read_timestamp(buffer: &mut ByteBuffer, c: u8) -> i64 {
    let mid = buffer.read_u16();
    let low = buffer.read_u16();
    decode_timestamp(c, mid, low)
}

fn corrupted(message: &str) -> EngineError {
    engine_error!(
        ErrorDomain::Demuxer,
        DemuxerErrorCode::Corrupted,
        MODULE,
        "Corrupted media source. {}",
        message
    )
}

/// 从剩余 PES 长度中扣除 `n` 字节，不够扣视为损坏
fn consume(len: &mut usize, n: usize, what: &str) -> Result<()> {
    *len = len
        .checked_sub(n)
        .ok_or_else(|| corrupted(&format!("The {} is larger than the PES packet length.", what)))?;
    Ok(())
}

/// 逐字节扫描 `00 00 01 xx`，返回 0x1xx；流结束返回 None
fn find_start_code(buffer: &mut ByteBuffer) -> Option<u32> {
    let mut code: u32 = 0xFFFF_FFFF;
    loop {
        let byte = buffer.read_u8();
        if buffer.is_eos() {
            return None;
        }
        code = (code << 8) | byte as u32;
        if code & 0xFFFF_FF00 == 0x0000_0100 {
            return Some(code);
        }
    }
}

struct PesHeader {
    id: u32,
    pts: i64,
    dts: i64,
    payload_len: usize,
}

fn read_pes_header(buffer: &mut ByteBuffer) -> Result<Option<PesHeader>> {
    // 找到下一个 PES，途中遇到的其它头全部跳过
    let mut code = loop {
        let Some(code) = find_start_code(buffer) else {
            return Ok(None);
        };
        match code {
            PACK_HEADER_CODE | SYSTEM_HEADER_CODE | PROGRAM_END_CODE => continue,
            0x1C0..=0x1EF | PRIVATE_STREAM_1 => break code,
            // 基本流内部的起始码，说明没有对齐，继续扫描
            c if c < PROGRAM_END_CODE => {
                trace!("忽略基本流起始码 0x{:03x}", c);
                continue;
            }
            // PSM、padding 以及不支持的 PES
            _ => {
                let len = buffer.read_u16() as usize;
                trace!("跳过 0x{:03x}（{} 字节）", code, len);
                buffer.skip(len);
            }
        }
    };

    let mut len = buffer.read_u16() as usize;
    let mut c = buffer.read_u8();
    consume(&mut len, 1, "PES header")?;

    let mut pts = 0;
    let mut dts = 0;

    if c >> 6 == 2 {
        // MPEG-2
        let flags = buffer.read_u8();
        let mut hlen = buffer.read_u8() as usize;
        consume(&mut len, 2, "PES header")?;

        if hlen > len {
            return Err(corrupted(
                "The header length is larger than the PES packet length.",
            ));
        }
        len -= hlen;

        match flags >> 6 {
            2 => {
                consume(&mut hlen, 5, "PTS field")?;
                c = buffer.read_u8();
                pts = read_timestamp(buffer, c);
                dts = pts;
            }
            3 => {
                consume(&mut hlen, 10, "PTS/DTS field")?;
                c = buffer.read_u8();
                pts = read_timestamp(buffer, c);
                c = buffer.read_u8();
                dts = read_timestamp(buffer, c);
            }
            _ => {}
        }

        buffer.skip(hlen);
    } else {
        // MPEG-1：填充字节
        while c == 0xFF && !buffer.is_eos() {
            consume(&mut len, 1, "stuffing")?;
            c = buffer.read_u8();
        }

        // STD buffer scale/size
        if c >> 6 == 1 {
            consume(&mut len, 2, "STD buffer field")?;
            buffer.read_u8();
            c = buffer.read_u8();
        }

        match c >> 4 {
            2 => {
                consume(&mut len, 4, "PTS field")?;
                pts = read_timestamp(buffer, c);
                dts = pts;
            }
            3 => {
                consume(&mut len, 9, "PTS/DTS field")?;
                pts = read_timestamp(buffer, c);
                c = buffer.read_u8();
                dts = read_timestamp(buffer, c);
            }
            _ => {}
        }
    }

    // DVD：私有流 1 承载非 MPEG 音频和字幕
    if code == PRIVATE_STREAM_1 {
        consume(&mut len, 1, "sub-stream id")?;
        code = buffer.read_u8() as u32;

        if (0x80..=0xCF).contains(&code) {
            // LPCM/AC3/DTS 音频头；MLP/TrueHD 多一个字节
            let header = if (0xB0..=0xBF).contains(&code) { 4 } else { 3 };
            consume(&mut len, header, "audio sub-header")?;
            buffer.skip(header);
        }
    }

    if buffer.is_eos() {
        debug!("PES 头部未读完就到达流末尾");
        return Ok(None);
    }

    Ok(Some(PesHeader {
        id: code,
        pts,
        dts,
        payload_len: len,
    }))
}

/// MPEG-1/2 Program Stream 解复用器
pub struct MpegDemuxer {
    buffer: Option<ByteBuffer>,
    packets: u64,
}

impl MpegDemuxer {
    pub fn new() -> Self {
        Self {
            buffer: None,
            packets: 0,
        }
    }

    /// 到达流末尾：区分正常结束和数据源错误
    fn finish(buffer: &mut ByteBuffer) -> Result<Option<Packet>> {
        match buffer.take_error() {
            Some(err) => Err(EngineError::from_io("input", &err)),
            None => Ok(None),
        }
    }
}

impl Default for MpegDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl DemuxerSource for MpegDemuxer {
    fn open(&mut self, buffer: ByteBuffer) -> Result<()> {
        info!("📦 MPEG 解复用器已打开");
        self.buffer = Some(buffer);
        self.packets = 0;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let buffer = self.buffer.as_mut().ok_or_else(|| {
            engine_error!(
                ErrorDomain::Demuxer,
                DemuxerErrorCode::Failed,
                MODULE,
                "Demuxer has not been opened."
            )
        })?;

        loop {
            let Some(header) = read_pes_header(buffer)? else {
                debug!("MPEG 解复用结束，共 {} 个包", self.packets);
                return Self::finish(buffer);
            };

            if header.payload_len == 0 {
                trace!("跳过空 PES（id 0x{:x}）", header.id);
                continue;
            }

            let mut data = vec![0u8; header.payload_len];
            let read = buffer.read_bytes(&mut data);
            if read == 0 {
                return Self::finish(buffer);
            }
            if read < header.payload_len {
                debug!("PES 负载被截断: {}/{} 字节", read, header.payload_len);
                data.truncate(read);
            }

            self.packets += 1;
            return Ok(Some(Packet {
                stream_id: header.id,
                codec: CodecId::from_stream_id(header.id),
                data,
                pts: header.pts,
                dts: header.dts,
            }));
        }
    }

    fn is_eos(&self) -> bool {
        self.buffer.as_ref().map_or(true, |b| b.is_eos())
    }

    fn description(&self) -> String {
        format!("MPEG Program Stream ({} packets)", self.packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::buffer::{ByteSource, ReaderSource};
    use crate::player::testing::{
        encode_timestamp, pack_header, pes_mpeg1, pes_mpeg2, pes_private, system_header,
    };
    use std::io::{self, Cursor};

    fn demuxer_over(data: Vec<u8>, capacity: usize) -> MpegDemuxer {
        let mut demuxer = MpegDemuxer::new();
        demuxer
            .open(ByteBuffer::new(ReaderSource::new(Cursor::new(data)), capacity))
            .unwrap();
        demuxer
    }

    #[test]
    fn test_timestamp_vector() {
        // 90000 = (2 << 15) | 24464
        assert_eq!(decode_timestamp(0x21, 0x0005, 0xBF21), 90_000);
        // 高 3 位为 101
        assert_eq!(decode_timestamp(0x2B, 0x0001, 0x0001), 5 << 30);

        let bytes = encode_timestamp(0x2, 0x1_2345_6789);
        let mid = u16::from_be_bytes([bytes[1], bytes[2]]);
        let low = u16::from_be_bytes([bytes[3], bytes[4]]);
        assert_eq!(decode_timestamp(bytes[0], mid, low), 0x1_2345_6789);
    }

    #[test]
    fn test_reads_video_and_audio_pes() {
        let mut stream = pack_header();
        stream.extend(system_header());
        stream.extend(pes_mpeg2(0xE0, Some((90_000, 90_000)), &[1, 2, 3, 4]));
        stream.extend(pes_mpeg2(0xC0, Some((93_000, 91_000)), &[9, 8, 7]));
        stream.extend([0x00, 0x00, 0x01, 0xB9]);

        let mut demuxer = demuxer_over(stream, 16);

        let video = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(video.stream_id, 0x1E0);
        assert_eq!(video.codec, CodecId::Mpeg2Video);
        assert_eq!(video.pts, 90_000);
        assert_eq!(video.dts, 90_000);
        assert_eq!(video.data, vec![1, 2, 3, 4]);

        let audio = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(audio.stream_id, 0x1C0);
        assert_eq!(audio.codec, CodecId::Mp3);
        assert_eq!(audio.pts, 93_000);
        assert_eq!(audio.dts, 91_000);
        assert_eq!(audio.data, vec![9, 8, 7]);

        assert_eq!(demuxer.read_packet().unwrap(), None);
        assert!(demuxer.is_eos());
        // 末尾之后继续返回 None
        assert_eq!(demuxer.read_packet().unwrap(), None);
    }

    #[test]
    fn test_skips_unsupported_stream_by_length() {
        // padding 流里伪造一个视频起始码，必须整体跳过
        let mut stream = vec![0x00, 0x00, 0x01, 0xBE, 0x00, 0x06, 0x00, 0x00, 0x01, 0xE0, 0xFF, 0xFF];
        stream.extend(pes_mpeg2(0xE2, None, &[5, 5]));

        let mut demuxer = demuxer_over(stream, 4);
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(packet.stream_id, 0x1E2);
        assert_eq!(packet.pts, 0);
        assert_eq!(packet.data, vec![5, 5]);
    }

    #[test]
    fn test_private_stream_substreams() {
        let mut stream = pes_private(0x80, &[0xAA, 0xBB]);
        stream.extend(pes_private(0xB1, &[0xCC]));
        stream.extend(pes_private(0x21, &[0xDD, 0xEE, 0xFF]));
        stream.extend(pes_private(0x89, &[0x11]));

        let mut demuxer = demuxer_over(stream, 2048);

        let ac3 = demuxer.read_packet().unwrap().unwrap();
        assert_eq!((ac3.stream_id, ac3.codec), (0x80, CodecId::Ac3));
        assert_eq!(ac3.data, vec![0xAA, 0xBB]);

        let mlp = demuxer.read_packet().unwrap().unwrap();
        assert_eq!((mlp.stream_id, mlp.codec), (0xB1, CodecId::Unknown));
        assert_eq!(mlp.data, vec![0xCC]);

        let sub = demuxer.read_packet().unwrap().unwrap();
        assert_eq!((sub.stream_id, sub.codec), (0x21, CodecId::DvdSubpicture));
        assert_eq!(sub.data, vec![0xDD, 0xEE, 0xFF]);

        let dts = demuxer.read_packet().unwrap().unwrap();
        assert_eq!((dts.stream_id, dts.codec), (0x89, CodecId::Dts));
        assert_eq!(dts.data, vec![0x11]);
    }

    #[test]
    fn test_mpeg1_header() {
        let mut stream = pes_mpeg1(0xC1, Some(45_000), true, &[1, 2, 3]);
        stream.extend(pes_mpeg1(0xE0, None, false, &[4]));

        let mut demuxer = demuxer_over(stream, 5);
        let first = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(first.stream_id, 0x1C1);
        assert_eq!(first.pts, 45_000);
        assert_eq!(first.dts, 45_000);
        assert_eq!(first.data, vec![1, 2, 3]);

        let second = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(second.stream_id, 0x1E0);
        assert_eq!(second.pts, 0);
        assert_eq!(second.data, vec![4]);
    }

    #[test]
    fn test_header_length_overflow_is_corruption() {
        // 外层长度 5，但声明的头部长度为 10
        let mut stream = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x05, 0x80, 0x80, 0x0A, 0x21, 0x00];
        stream.extend(pes_mpeg2(0xE0, Some((3_000, 3_000)), &[7, 7]));

        let mut demuxer = demuxer_over(stream, 2048);
        let err = demuxer.read_packet().unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Demuxer);
        assert!(err.is_corruption());
        assert_eq!(err.module, "demuxer-mpeg");

        // 错误只影响当前包，之后重新同步
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(packet.pts, 3_000);
        assert_eq!(packet.data, vec![7, 7]);
    }

    #[test]
    fn test_tiny_packet_length_is_corruption() {
        // 长度为 0 的 PES 连首字节都放不下
        let stream = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x80, 0x05];
        let mut demuxer = demuxer_over(stream, 2048);
        assert!(demuxer.read_packet().unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_payload_returns_available_bytes() {
        let mut stream = pes_mpeg2(0xE0, None, &[1, 2, 3, 4, 5, 6]);
        stream.truncate(stream.len() - 2);

        let mut demuxer = demuxer_over(stream, 3);
        let packet = demuxer.read_packet().unwrap().unwrap();
        assert_eq!(packet.data, vec![1, 2, 3, 4]);
        assert_eq!(demuxer.read_packet().unwrap(), None);
    }

    #[test]
    fn test_empty_source() {
        let mut demuxer = demuxer_over(Vec::new(), 16);
        assert_eq!(demuxer.read_packet().unwrap(), None);
    }

    #[test]
    fn test_not_opened() {
        let mut demuxer = MpegDemuxer::new();
        let err = demuxer.read_packet().unwrap_err();
        assert_eq!(err.code, DemuxerErrorCode::Failed as i32);
        assert!(demuxer.is_eos());
    }

    struct BrokenSource {
        sent: bool,
    }

    impl ByteSource for BrokenSource {
        fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::from_raw_os_error(5));
            }
            self.sent = true;
            buf[..4].copy_from_slice(&[0x00, 0x00, 0x01, 0xBA]);
            Ok(4)
        }
    }

    #[test]
    fn test_source_failure_reported_as_input_error() {
        let mut demuxer = MpegDemuxer::new();
        demuxer
            .open(ByteBuffer::new(BrokenSource { sent: false }, 16))
            .unwrap();
        let err = demuxer.read_packet().unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Input);
        assert_eq!(err.code, -5);
    }
}
