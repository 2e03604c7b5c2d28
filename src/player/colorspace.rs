use crate::core::{
    ColorspaceErrorCode, EngineError, ErrorDomain, Frame, PixelFormat, Result, SubtitleFrame,
    VideoFrame,
};
use crate::engine_error;
use log::debug;

const MODULE: &str = "colorspace";

/// 转换器的标识：源格式、目标格式和尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorspaceKey {
    pub src: PixelFormat,
    pub dst: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// 色彩空间转换器
///
/// 视频帧转换后仍是视频帧，字幕帧转换后保留原来的位置。
pub trait Colorspace: Send {
    fn key(&self) -> ColorspaceKey;

    fn convert(&mut self, frame: &Frame) -> Result<Frame>;
}

fn unsupported(key: &ColorspaceKey) -> EngineError {
    engine_error!(
        ErrorDomain::Colorspace,
        ColorspaceErrorCode::Unsupported,
        MODULE,
        "不支持的转换 {:?} -> {:?}",
        key.src,
        key.dst
    )
}

fn failed(message: String) -> EngineError {
    engine_error!(ErrorDomain::Colorspace, ColorspaceErrorCode::Failed, MODULE, "{}", message)
}

/// 纯 Rust 实现（BT.601 有限范围）
pub struct SoftwareColorspace {
    key: ColorspaceKey,
}

impl SoftwareColorspace {
    pub fn new(key: ColorspaceKey) -> Result<Self> {
        let supported = matches!(
            (key.src, key.dst),
            (PixelFormat::Yuv420p, PixelFormat::Yuv420p)
                | (PixelFormat::Rgb32, PixelFormat::Rgb32)
                | (PixelFormat::Rgb32, PixelFormat::Yuv420p)
                | (PixelFormat::Yuv420p, PixelFormat::Rgb32)
        );
        if !supported {
            return Err(unsupported(&key));
        }
        if key.width == 0 || key.height == 0 {
            return Err(failed(format!("无效的尺寸 {}x{}", key.width, key.height)));
        }

        debug!(
            "创建软件色彩空间转换器: {:?} -> {:?} ({}x{})",
            key.src, key.dst, key.width, key.height
        );
        Ok(Self { key })
    }

    /// 检查源平面的尺寸，避免越界
    fn check_planes(&self, format: PixelFormat, data: &[Vec<u8>; 4], linesize: &[usize; 4]) -> Result<()> {
        if format != self.key.src {
            return Err(failed(format!(
                "帧格式 {:?} 与转换器 {:?} 不一致",
                format, self.key.src
            )));
        }
        for (i, layout) in format.plane_layout().iter().enumerate() {
            let Some((wdiv, hdiv, bpp)) = layout else {
                continue;
            };
            let row_bytes = self.key.width.div_ceil(*wdiv) as usize * bpp;
            let rows = self.key.height.div_ceil(*hdiv) as usize;
            let needed = linesize[i] * (rows - 1) + row_bytes;
            if linesize[i] < row_bytes || data[i].len() < needed {
                return Err(failed(format!(
                    "平面 {} 数据不足: {} 字节, 需要 {}",
                    i,
                    data[i].len(),
                    needed
                )));
            }
        }
        Ok(())
    }

    fn convert_planes(&self, data: &[Vec<u8>; 4], linesize: &[usize; 4]) -> VideoFrame {
        let ColorspaceKey {
            src,
            dst,
            width,
            height,
        } = self.key;
        let mut out = VideoFrame::alloc(width, height, dst);

        match (src, dst) {
            (PixelFormat::Rgb32, PixelFormat::Yuv420p) => {
                rgb32_to_yuv420p(&data[0], linesize[0], width as usize, height as usize, &mut out)
            }
            (PixelFormat::Yuv420p, PixelFormat::Rgb32) => {
                yuv420p_to_rgb32(data, linesize, width as usize, height as usize, &mut out)
            }
            _ => {
                // 同格式：按行紧凑拷贝
                for (i, layout) in dst.plane_layout().iter().enumerate() {
                    let Some((_, hdiv, _)) = layout else {
                        continue;
                    };
                    let rows = height.div_ceil(*hdiv) as usize;
                    let row_bytes = out.linesize[i];
                    for row in 0..rows {
                        let s = row * linesize[i];
                        let d = row * row_bytes;
                        out.data[i][d..d + row_bytes].copy_from_slice(&data[i][s..s + row_bytes]);
                    }
                }
            }
        }
        out
    }
}

impl Colorspace for SoftwareColorspace {
    fn key(&self) -> ColorspaceKey {
        self.key
    }

    fn convert(&mut self, frame: &Frame) -> Result<Frame> {
        match frame {
            Frame::Video(video) => {
                if video.width != self.key.width || video.height != self.key.height {
                    return Err(failed(format!(
                        "帧尺寸 {}x{} 与转换器 {}x{} 不一致",
                        video.width, video.height, self.key.width, self.key.height
                    )));
                }
                self.check_planes(video.format, &video.data, &video.linesize)?;
                Ok(Frame::Video(self.convert_planes(&video.data, &video.linesize)))
            }
            Frame::Subtitle(sub) => {
                if sub.width != self.key.width || sub.height != self.key.height {
                    return Err(failed(format!(
                        "字幕尺寸 {}x{} 与转换器 {}x{} 不一致",
                        sub.width, sub.height, self.key.width, self.key.height
                    )));
                }
                self.check_planes(sub.format, &sub.data, &sub.linesize)?;
                let converted = self.convert_planes(&sub.data, &sub.linesize);
                Ok(Frame::Subtitle(SubtitleFrame {
                    x: sub.x,
                    y: sub.y,
                    width: sub.width,
                    height: sub.height,
                    format: converted.format,
                    data: converted.data,
                    linesize: converted.linesize,
                }))
            }
            other => Err(failed(format!("无法转换 {} 帧", other.kind()))),
        }
    }
}

fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

/// RGB32（B,G,R,A）-> YUV420P，色度取 2x2 块的平均值；alpha 被丢弃
fn rgb32_to_yuv420p(src: &[u8], stride: usize, width: usize, height: usize, out: &mut VideoFrame) {
    let pixel = |x: usize, y: usize| {
        let p = y * stride + x * 4;
        (src[p + 2] as i32, src[p + 1] as i32, src[p] as i32)
    };

    for y in 0..height {
        let row = y * out.linesize[0];
        for x in 0..width {
            let (r, g, b) = pixel(x, y);
            out.data[0][row + x] = luma(r, g, b);
        }
    }

    for cy in 0..height.div_ceil(2) {
        for cx in 0..width.div_ceil(2) {
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for y in (cy * 2)..(cy * 2 + 2).min(height) {
                for x in (cx * 2)..(cx * 2 + 2).min(width) {
                    let (pr, pg, pb) = pixel(x, y);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (u, v) = chroma(r / n, g / n, b / n);
            out.data[1][cy * out.linesize[1] + cx] = u;
            out.data[2][cy * out.linesize[2] + cx] = v;
        }
    }
}

/// YUV420P -> RGB32（B,G,R,A），alpha 固定为 255
fn yuv420p_to_rgb32(
    data: &[Vec<u8>; 4],
    linesize: &[usize; 4],
    width: usize,
    height: usize,
    out: &mut VideoFrame,
) {
    for y in 0..height {
        for x in 0..width {
            let c = data[0][y * linesize[0] + x] as i32 - 16;
            let d = data[1][(y / 2) * linesize[1] + x / 2] as i32 - 128;
            let e = data[2][(y / 2) * linesize[2] + x / 2] as i32 - 128;

            let r = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u8;
            let g = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u8;
            let b = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u8;

            let p = y * out.linesize[0] + x * 4;
            out.data[0][p..p + 4].copy_from_slice(&[b, g, r, 255]);
        }
    }
}

#[cfg(feature = "ffmpeg")]
pub use sws::SwsColorspace;

#[cfg(feature = "ffmpeg")]
mod sws {
    use super::{failed, Colorspace, ColorspaceKey, MODULE};
    use crate::core::{Frame, PixelFormat, Result, SubtitleFrame, VideoFrame};
    use ffmpeg_next::{software, util};

    fn to_pixel(format: PixelFormat) -> Option<util::format::Pixel> {
        match format {
            PixelFormat::Yuv420p => Some(util::format::Pixel::YUV420P),
            // 小端 RGB32 的内存布局就是 BGRA
            PixelFormat::Rgb32 => Some(util::format::Pixel::BGRA),
            PixelFormat::Unknown => None,
        }
    }

    /// libswscale 实现
    pub struct SwsColorspace {
        key: ColorspaceKey,
        context: software::scaling::Context,
    }

    // SwsContext 本身不是 Send，但每个转换器只在一个工作线程中使用
    unsafe impl Send for SwsColorspace {}

    impl SwsColorspace {
        pub fn new(key: ColorspaceKey) -> Result<Self> {
            let (Some(src), Some(dst)) = (to_pixel(key.src), to_pixel(key.dst)) else {
                return Err(super::unsupported(&key));
            };
            let context = software::scaling::Context::get(
                src,
                key.width,
                key.height,
                dst,
                key.width,
                key.height,
                software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| failed(format!("{}: {}", MODULE, e)))?;
            Ok(Self { key, context })
        }

        fn run(&mut self, data: &[Vec<u8>; 4], linesize: &[usize; 4]) -> Result<VideoFrame> {
            let src_fmt = to_pixel(self.key.src).ok_or_else(|| super::unsupported(&self.key))?;
            let dst_fmt = to_pixel(self.key.dst).ok_or_else(|| super::unsupported(&self.key))?;

            let mut input = util::frame::Video::new(src_fmt, self.key.width, self.key.height);
            for (i, layout) in self.key.src.plane_layout().iter().enumerate() {
                let Some((_, hdiv, _)) = layout else {
                    continue;
                };
                let rows = self.key.height.div_ceil(*hdiv) as usize;
                let dst_stride = input.stride(i);
                let row_bytes = dst_stride.min(linesize[i]);
                let plane = input.data_mut(i);
                for row in 0..rows {
                    let s = row * linesize[i];
                    if s + row_bytes > data[i].len() {
                        return Err(failed(format!("平面 {} 数据不足", i)));
                    }
                    plane[row * dst_stride..row * dst_stride + row_bytes]
                        .copy_from_slice(&data[i][s..s + row_bytes]);
                }
            }

            let mut output = util::frame::Video::new(dst_fmt, self.key.width, self.key.height);
            self.context
                .run(&input, &mut output)
                .map_err(|e| failed(format!("swscale 失败: {}", e)))?;

            let mut frame = VideoFrame::alloc(self.key.width, self.key.height, self.key.dst);
            for (i, layout) in self.key.dst.plane_layout().iter().enumerate() {
                let Some((_, hdiv, _)) = layout else {
                    continue;
                };
                let rows = self.key.height.div_ceil(*hdiv) as usize;
                let stride = output.stride(i);
                let row_bytes = frame.linesize[i];
                let plane = output.data(i);
                for row in 0..rows {
                    frame.data[i][row * row_bytes..(row + 1) * row_bytes]
                        .copy_from_slice(&plane[row * stride..row * stride + row_bytes]);
                }
            }
            Ok(frame)
        }
    }

    impl Colorspace for SwsColorspace {
        fn key(&self) -> ColorspaceKey {
            self.key
        }

        fn convert(&mut self, frame: &Frame) -> Result<Frame> {
            match frame {
                Frame::Video(video) => Ok(Frame::Video(self.run(&video.data, &video.linesize)?)),
                Frame::Subtitle(sub) => {
                    let converted = self.run(&sub.data, &sub.linesize)?;
                    Ok(Frame::Subtitle(SubtitleFrame {
                        x: sub.x,
                        y: sub.y,
                        width: sub.width,
                        height: sub.height,
                        format: converted.format,
                        data: converted.data,
                        linesize: converted.linesize,
                    }))
                }
                other => Err(failed(format!("无法转换 {} 帧", other.kind()))),
            }
        }
    }
}
