//! libavcodec 编解码器（需要 `ffmpeg` 特性）

use crate::core::{
    AudioFrame, CodecErrorCode, CodecId, EngineError, ErrorDomain, Frame, MediaType, Packet,
    PixelFormat, RawFrame, Result, SampleFormat, StreamProperties, SubtitleFrame, VideoFrame,
};
use crate::engine_error;
use crate::player::codec::Codec;
use crate::player::queue::BlockingQueue;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi::{self, AVSubtitleType};
use ffmpeg_next::{codec, software, util};
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::os::raw::c_int;
use std::{ptr, slice};

const MODULE: &str = "codec-libavcodec";
const NOPTS: i64 = ffi::AV_NOPTS_VALUE as i64;

fn failed(message: String) -> EngineError {
    engine_error!(ErrorDomain::Codec, CodecErrorCode::Failed, MODULE, "{}", message)
}

fn av_codec_id(id: CodecId) -> Option<codec::Id> {
    match id {
        CodecId::Mpeg2Video => Some(codec::Id::MPEG2VIDEO),
        CodecId::Mp3 => Some(codec::Id::MP3),
        CodecId::Ac3 => Some(codec::Id::AC3),
        CodecId::Dts => Some(codec::Id::DTS),
        CodecId::DvdSubpicture => Some(codec::Id::DVD_SUBTITLE),
        CodecId::Unknown => None,
    }
}

fn or_zero(ts: i64) -> i64 {
    if ts == NOPTS {
        0
    } else {
        ts
    }
}

fn is_eagain(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == util::error::EAGAIN)
}

enum Inner {
    Video {
        decoder: codec::decoder::Video,
        // 非 YUV420P 的输出（如 4:2:2）先转成 YUV420P
        scaler: Option<software::scaling::Context>,
    },
    Audio {
        decoder: codec::decoder::Audio,
        resampler: Option<software::resampling::Context>,
    },
    Subtitle {
        decoder: codec::decoder::Subtitle,
    },
}

/// libavcodec 解码器 + libavcodec 帧切分器（av_parser）
///
/// 解码出的平面数据会立即拷贝到帧自己的缓冲区，不依赖解码器内部的帧。
pub struct FfmpegCodec {
    id: CodecId,
    inner: Inner,
    parser: *mut ffi::AVCodecParserContext,
    properties: StreamProperties,
    pending: VecDeque<Frame>,
    stream_id: u32,
}

// 解码器和 parser 持有裸指针；Stream 的锁保证同一时刻只有一个线程访问
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
    pub fn new(id: CodecId) -> Result<Self> {
        let av_id = av_codec_id(id).ok_or_else(|| failed(format!("不支持的编码 {:?}", id)))?;
        let av_codec = ffmpeg::decoder::find(av_id)
            .ok_or_else(|| failed(format!("libavcodec 中找不到 {} 解码器", id.description())))?;

        let opened = codec::context::Context::new().decoder().open_as(av_codec)?;
        let inner = match id.media_type() {
            MediaType::Video => Inner::Video {
                decoder: opened.video()?,
                scaler: None,
            },
            MediaType::Audio => Inner::Audio {
                decoder: opened.audio()?,
                resampler: None,
            },
            _ => Inner::Subtitle {
                decoder: opened.subtitle()?,
            },
        };

        let raw_id: ffi::AVCodecID = av_id.into();
        let parser = unsafe { ffi::av_parser_init(raw_id as c_int) };
        if parser.is_null() {
            warn!("{} 没有 av_parser，按整包送入解码器", id.description());
        }
        info!("🎞 创建 libavcodec 解码器: {}", id.description());

        Ok(Self {
            id,
            inner,
            parser,
            properties: StreamProperties::default(),
            pending: VecDeque::new(),
            stream_id: 0,
        })
    }

    fn context_ptr(&mut self) -> *mut ffi::AVCodecContext {
        unsafe {
            match &mut self.inner {
                Inner::Video { decoder, .. } => decoder.as_mut_ptr(),
                Inner::Audio { decoder, .. } => decoder.as_mut_ptr(),
                Inner::Subtitle { decoder } => decoder.as_mut_ptr(),
            }
        }
    }

    /// 从 parser/解码器上下文刷新属性（parser 会从码流头中解析出尺寸和采样率）
    fn refresh_properties(&mut self) {
        match &self.inner {
            Inner::Video { .. } => {
                if !self.parser.is_null() {
                    let (width, height) = unsafe { ((*self.parser).width, (*self.parser).height) };
                    if width > 0 && height > 0 {
                        self.properties.width = width as u32;
                        self.properties.height = height as u32;
                    }
                }
                if self.properties.pixel_format == PixelFormat::Unknown {
                    self.properties.pixel_format = PixelFormat::Yuv420p;
                }
            }
            Inner::Audio { decoder, .. } => {
                if decoder.rate() > 0 {
                    self.properties.sample_rate = decoder.rate();
                    self.properties.channels = decoder.channels();
                }
                self.properties.sample_format = SampleFormat::S16;
            }
            Inner::Subtitle { .. } => {}
        }
    }

    fn decode_into_pending(&mut self, raw: &RawFrame) -> Result<()> {
        match self.inner {
            Inner::Video { .. } => self.decode_video(Some(&Self::packet_for(raw))),
            Inner::Audio { .. } => self.decode_audio(Some(&Self::packet_for(raw))),
            Inner::Subtitle { .. } => self.decode_subtitle(raw),
        }
    }

    /// 取出 parser 中缓存的最后一帧（parser 要看到下一帧的起始码才会交出当前帧）
    fn drain_parser(&mut self) -> Option<RawFrame> {
        if self.parser.is_null() {
            return None;
        }
        let context = self.context_ptr();
        let mut out: *mut u8 = ptr::null_mut();
        let mut out_size: c_int = 0;
        unsafe {
            ffi::av_parser_parse2(
                self.parser,
                context,
                &mut out,
                &mut out_size,
                ptr::null(),
                0,
                NOPTS,
                NOPTS,
                0,
            );
        }
        if out_size <= 0 || out.is_null() {
            return None;
        }

        let (pts, dts) = unsafe { ((*self.parser).pts, (*self.parser).dts) };
        let data = unsafe { slice::from_raw_parts(out, out_size as usize) }.to_vec();
        Some(RawFrame {
            stream_id: self.stream_id,
            data,
            pts: or_zero(pts),
            dts: or_zero(dts),
        })
    }

    fn packet_for(raw: &RawFrame) -> ffmpeg::Packet {
        let mut packet = ffmpeg::Packet::copy(&raw.data);
        packet.set_pts(Some(raw.pts));
        packet.set_dts(Some(raw.dts));
        packet
    }

    /// `packet` 为 None 时送入 EOF，取出解码器中剩余的帧
    fn decode_video(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<()> {
        let Inner::Video { decoder, scaler } = &mut self.inner else {
            return Ok(());
        };
        let sent = match packet {
            Some(packet) => decoder.send_packet(packet),
            None => decoder.send_eof(),
        };
        match sent {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) if is_eagain(&e) => {}
            Err(e) => return Err(e.into()),
        }

        loop {
            let mut decoded = util::frame::Video::empty();
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(e) if is_eagain(&e) => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }

            let frame = if decoded.format() == util::format::Pixel::YUV420P {
                decoded
            } else {
                if scaler.is_none() {
                    debug!("视频输出格式 {:?}，转换为 YUV420P", decoded.format());
                    *scaler = Some(software::scaling::Context::get(
                        decoded.format(),
                        decoded.width(),
                        decoded.height(),
                        util::format::Pixel::YUV420P,
                        decoded.width(),
                        decoded.height(),
                        software::scaling::Flags::BILINEAR,
                    )?);
                }
                let mut converted = util::frame::Video::empty();
                if let Some(scaler) = scaler.as_mut() {
                    scaler.run(&decoded, &mut converted)?;
                }
                converted
            };

            let mut video = VideoFrame {
                width: frame.width(),
                height: frame.height(),
                format: PixelFormat::Yuv420p,
                data: Default::default(),
                linesize: [0; 4],
            };
            for plane in 0..3 {
                video.data[plane] = frame.data(plane).to_vec();
                video.linesize[plane] = frame.stride(plane);
            }

            self.properties.width = video.width;
            self.properties.height = video.height;
            self.properties.pixel_format = PixelFormat::Yuv420p;
            self.pending.push_back(Frame::Video(video));
        }
        Ok(())
    }

    fn decode_audio(&mut self, packet: Option<&ffmpeg::Packet>) -> Result<()> {
        let Inner::Audio { decoder, resampler } = &mut self.inner else {
            return Ok(());
        };
        let sent = match packet {
            Some(packet) => decoder.send_packet(packet),
            None => decoder.send_eof(),
        };
        match sent {
            Ok(()) | Err(ffmpeg::Error::Eof) => {}
            Err(e) if is_eagain(&e) => {}
            Err(e) => return Err(e.into()),
        }

        loop {
            let mut decoded = util::frame::Audio::empty();
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {}
                Err(e) if is_eagain(&e) => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }

            if resampler.is_none() {
                debug!(
                    "🔧 初始化音频重采样器: {:?} {}Hz/{}ch → S16",
                    decoded.format(),
                    decoded.rate(),
                    decoded.channels()
                );
                *resampler = Some(software::resampling::Context::get(
                    decoded.format(),
                    decoded.channel_layout(),
                    decoded.rate(),
                    util::format::Sample::I16(util::format::sample::Type::Packed),
                    decoded.channel_layout(),
                    decoded.rate(),
                )?);
            }

            let mut resampled = util::frame::Audio::empty();
            if let Some(resampler) = resampler.as_mut() {
                resampler.run(&decoded, &mut resampled)?;
            }

            let bytes = resampled.samples() * decoded.channels() as usize * 2;
            let data = resampled.data(0);
            let data = data[..bytes.min(data.len())].to_vec();

            self.properties.channels = decoded.channels();
            self.properties.sample_rate = decoded.rate();
            self.properties.sample_format = SampleFormat::S16;
            self.pending.push_back(Frame::Audio(AudioFrame { data }));
        }
        Ok(())
    }

    /// DVD 字幕：取第一个位图区域，调色板展开成 RGB32（B,G,R,A）
    fn decode_subtitle(&mut self, raw: &RawFrame) -> Result<()> {
        let Inner::Subtitle { decoder } = &mut self.inner else {
            return Ok(());
        };
        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::new();
        let got = match decoder.decode(&Self::packet_for(raw), &mut subtitle) {
            Ok(got) => got,
            Err(e) if is_eagain(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !got {
            return Ok(());
        }

        let mut region = None;
        for rect in subtitle.rects() {
            unsafe {
                let raw_rect = rect.as_ptr();
                if (*raw_rect).type_ != AVSubtitleType::SUBTITLE_BITMAP || region.is_some() {
                    continue;
                }
                let width = (*raw_rect).w.max(0) as usize;
                let height = (*raw_rect).h.max(0) as usize;
                let stride = (*raw_rect).linesize[0].max(0) as usize;
                let colors = (*raw_rect).nb_colors.max(0) as usize;
                if width == 0
                    || height == 0
                    || (*raw_rect).data[0].is_null()
                    || (*raw_rect).data[1].is_null()
                {
                    continue;
                }

                let indices = slice::from_raw_parts((*raw_rect).data[0], stride * height);
                let palette = slice::from_raw_parts((*raw_rect).data[1] as *const u32, colors);
                let mut pixels = Vec::with_capacity(width * height * 4);
                for y in 0..height {
                    for &index in &indices[y * stride..y * stride + width] {
                        let argb = palette.get(index as usize).copied().unwrap_or(0);
                        pixels.extend_from_slice(&argb.to_le_bytes());
                    }
                }

                region = Some(SubtitleFrame {
                    x: (*raw_rect).x.max(0) as u32,
                    y: (*raw_rect).y.max(0) as u32,
                    width: width as u32,
                    height: height as u32,
                    format: PixelFormat::Rgb32,
                    data: [pixels, Vec::new(), Vec::new(), Vec::new()],
                    linesize: [width * 4, 0, 0, 0],
                });
            }
        }

        // 必须释放 AVSubtitle，否则泄漏
        unsafe {
            ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        if let Some(region) = region {
            self.pending.push_back(Frame::Subtitle(region));
        }
        Ok(())
    }
}

impl Codec for FfmpegCodec {
    fn id(&self) -> CodecId {
        self.id
    }

    fn parse(&mut self, packet: &Packet, frames: &BlockingQueue<RawFrame>) -> Result<()> {
        let enqueue = |frame: RawFrame| {
            frames
                .try_enqueue(frame)
                .map_err(|_| failed("帧队列已关闭".to_string()))
        };

        self.stream_id = packet.stream_id;
        if self.parser.is_null() {
            return enqueue(RawFrame {
                stream_id: packet.stream_id,
                data: packet.data.clone(),
                pts: packet.pts,
                dts: packet.dts,
            });
        }

        let context = self.context_ptr();
        let mut data: &[u8] = &packet.data;
        let (mut pts, mut dts) = (packet.pts, packet.dts);

        while !data.is_empty() {
            let mut out: *mut u8 = ptr::null_mut();
            let mut out_size: c_int = 0;
            let used = unsafe {
                ffi::av_parser_parse2(
                    self.parser,
                    context,
                    &mut out,
                    &mut out_size,
                    data.as_ptr(),
                    data.len() as c_int,
                    pts,
                    dts,
                    0,
                )
            };
            if used < 0 {
                return Err(failed(format!("av_parser_parse2 失败: {}", used)));
            }
            data = &data[(used as usize).min(data.len())..];
            // 时间戳只属于包的第一段数据
            pts = NOPTS;
            dts = NOPTS;

            if out_size > 0 && !out.is_null() {
                let (frame_pts, frame_dts) = unsafe { ((*self.parser).pts, (*self.parser).dts) };
                let bytes = unsafe { slice::from_raw_parts(out, out_size as usize) }.to_vec();
                trace!("流 0x{:x} 切分出 {} 字节的帧", packet.stream_id, bytes.len());
                enqueue(RawFrame {
                    stream_id: packet.stream_id,
                    data: bytes,
                    pts: or_zero(frame_pts),
                    dts: or_zero(frame_dts),
                })?;
            } else if used == 0 {
                break;
            }
        }

        self.refresh_properties();
        Ok(())
    }

    fn decode(&mut self, frame: &RawFrame) -> Result<Option<Frame>> {
        // 上次多解出的帧优先交付
        let ready = self.pending.pop_front();
        self.decode_into_pending(frame)?;
        Ok(ready.or_else(|| self.pending.pop_front()))
    }

    fn flush(&mut self) -> Result<Vec<Frame>> {
        if let Some(raw) = self.drain_parser() {
            self.decode_into_pending(&raw)?;
        }
        match self.inner {
            Inner::Video { .. } => self.decode_video(None)?,
            Inner::Audio { .. } => self.decode_audio(None)?,
            Inner::Subtitle { .. } => {}
        }
        if !self.pending.is_empty() {
            debug!("{} 冲刷出 {} 帧", self.id.description(), self.pending.len());
        }
        Ok(self.pending.drain(..).collect())
    }

    fn properties(&self) -> StreamProperties {
        self.properties
    }
}

impl Drop for FfmpegCodec {
    fn drop(&mut self) {
        if !self.parser.is_null() {
            unsafe { ffi::av_parser_close(self.parser) };
            self.parser = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_of_idle_decoder_is_empty() {
        for id in [CodecId::Mpeg2Video, CodecId::Mp3] {
            let mut codec = FfmpegCodec::new(id).unwrap();
            assert!(codec.flush().unwrap().is_empty());
            // 解码器已经收到 EOF，再次冲刷不报错
            assert!(codec.flush().unwrap().is_empty());
        }
    }
}
