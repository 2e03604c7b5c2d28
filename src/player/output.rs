use crate::core::{
    EngineError, ErrorDomain, Frame, OutputErrorCode, Result, StreamInfo, SubtitleFrame,
};
use crate::engine_error;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// 输出设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Audio,
    Video,
}

/// 输出设备抽象接口
pub trait Output: Send {
    /// 按流属性打开设备
    fn open(&mut self, stream: &StreamInfo) -> Result<()>;

    /// 写入一帧解码后的数据
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// 写入叠加层（字幕）；默认忽略
    fn write_overlay(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn close(&mut self);

    fn description(&self) -> String;
}

fn not_opened(module: &str) -> EngineError {
    engine_error!(ErrorDomain::Output, OutputErrorCode::Failed, module, "输出设备尚未打开")
}

/// 丢弃所有数据的输出（只计数）
pub struct NullOutput {
    kind: OutputKind,
    stream: Option<StreamInfo>,
    frames: u64,
    overlays: u64,
}

impl NullOutput {
    pub fn new(kind: OutputKind) -> Self {
        Self {
            kind,
            stream: None,
            frames: 0,
            overlays: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl Output for NullOutput {
    fn open(&mut self, stream: &StreamInfo) -> Result<()> {
        info!("🔇 空输出 ({:?}) 打开: 流 0x{:x} {:?}", self.kind, stream.id, stream.properties);
        self.stream = Some(stream.clone());
        Ok(())
    }

    fn write(&mut self, _frame: &Frame) -> Result<()> {
        if self.stream.is_none() {
            return Err(not_opened("output-null"));
        }
        self.frames += 1;
        Ok(())
    }

    fn write_overlay(&mut self, _frame: &Frame) -> Result<()> {
        self.overlays += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                "空输出 ({:?}) 关闭: {} 帧, {} 个叠加层",
                self.kind, self.frames, self.overlays
            );
        }
    }

    fn description(&self) -> String {
        format!("null {:?} output", self.kind)
    }
}

/// 把原始数据写入文件：音频写 PCM，视频逐平面逐行写出（如 YUV420P 裸流）
///
/// 叠加层只记录最近的一个区域，不做合成。
pub struct FileOutput {
    kind: OutputKind,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes: u64,
    last_overlay: Option<SubtitleFrame>,
}

impl FileOutput {
    pub fn new(kind: OutputKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            writer: None,
            bytes: 0,
            last_overlay: None,
        }
    }

    pub fn last_overlay(&self) -> Option<&SubtitleFrame> {
        self.last_overlay.as_ref()
    }

    fn module(&self) -> &'static str {
        match self.kind {
            OutputKind::Audio => "output-audio-file",
            OutputKind::Video => "output-video-file",
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let module = self.module();
        let writer = self.writer.as_mut().ok_or_else(|| not_opened(module))?;
        writer.write_all(bytes).map_err(|e| {
            engine_error!(ErrorDomain::Output, OutputErrorCode::Failed, module, "写入失败: {}", e)
        })?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }
}

impl Output for FileOutput {
    fn open(&mut self, stream: &StreamInfo) -> Result<()> {
        let file = File::create(&self.path).map_err(|e| {
            engine_error!(
                ErrorDomain::Output,
                OutputErrorCode::Failed,
                self.module(),
                "无法创建 {}: {}",
                self.path.display(),
                e
            )
        })?;
        info!(
            "💾 文件输出打开: {} (流 0x{:x}, {:?})",
            self.path.display(),
            stream.id,
            stream.properties
        );
        self.writer = Some(BufWriter::new(file));
        self.bytes = 0;
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Audio(audio) => self.write_all(&audio.data),
            Frame::Video(video) => {
                for (i, layout) in video.format.plane_layout().iter().enumerate() {
                    let Some((wdiv, hdiv, bpp)) = layout else {
                        continue;
                    };
                    let row_bytes = video.width.div_ceil(*wdiv) as usize * bpp;
                    let rows = video.height.div_ceil(*hdiv) as usize;
                    for row in 0..rows {
                        let start = row * video.linesize[i];
                        let Some(line) = video.data[i].get(start..start + row_bytes) else {
                            return Err(engine_error!(
                                ErrorDomain::Output,
                                OutputErrorCode::Failed,
                                self.module(),
                                "视频平面 {} 数据不足",
                                i
                            ));
                        };
                        self.write_all(line)?;
                    }
                }
                Ok(())
            }
            other => {
                warn!("文件输出忽略 {} 帧", other.kind());
                Ok(())
            }
        }
    }

    fn write_overlay(&mut self, frame: &Frame) -> Result<()> {
        if let Frame::Subtitle(sub) = frame {
            debug!("记录字幕叠加层 {}x{} @ ({}, {})", sub.width, sub.height, sub.x, sub.y);
            self.last_overlay = Some(sub.clone());
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("文件输出 flush 失败: {}", e);
            }
            info!("文件输出关闭: {} ({} 字节)", self.path.display(), self.bytes);
        }
    }

    fn description(&self) -> String {
        format!("{:?} file output ({})", self.kind, self.path.display())
    }
}
