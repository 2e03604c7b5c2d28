use crate::core::{CodecId, EngineConfig, EngineError, ErrorDomain, ModulesErrorCode, Result};
use crate::engine_error;
use crate::player::codec::Codec;
use crate::player::colorspace::{Colorspace, ColorspaceKey};
use crate::player::demuxer::MpegDemuxer;
use crate::player::demuxer_source::{ContainerFormat, DemuxerSource};
use crate::player::input::{FileInput, Input};
use crate::player::output::{FileOutput, NullOutput, Output, OutputKind};
use log::{debug, info};
use std::collections::HashMap;

const MODULE: &str = "modules-manager";

type InputCtor = Box<dyn Fn() -> Box<dyn Input> + Send + Sync>;
type OutputCtor = Box<dyn Fn() -> Result<Box<dyn Output>> + Send + Sync>;
type DemuxerCtor = Box<dyn Fn() -> Box<dyn DemuxerSource> + Send + Sync>;
type CodecCtor = Box<dyn Fn(CodecId) -> Result<Box<dyn Codec>> + Send + Sync>;
type ColorspaceCtor = Box<dyn Fn(ColorspaceKey) -> Result<Box<dyn Colorspace>> + Send + Sync>;

/// 模块注册表
///
/// 按能力（协议、输出类型、容器格式、编码）查找构造函数。注册表在引擎创建前填好，
/// 之后只读，可以在线程之间共享。同一个键重复注册时，后注册的覆盖先注册的。
pub struct ModuleRegistry {
    inputs: HashMap<String, InputCtor>,
    outputs: HashMap<OutputKind, OutputCtor>,
    demuxers: HashMap<ContainerFormat, DemuxerCtor>,
    codecs: HashMap<CodecId, CodecCtor>,
    colorspace: Option<ColorspaceCtor>,
}

impl ModuleRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            demuxers: HashMap::new(),
            codecs: HashMap::new(),
            colorspace: None,
        }
    }

    /// 内置模块：本地文件输入、MPEG-PS 解复用器、按编译特性选择的编解码器和输出
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let mut registry = Self::new();

        registry.register_input("file", || -> Box<dyn Input> { Box::new(FileInput::new()) });
        registry.register_demuxer(ContainerFormat::MpegProgramStream, || -> Box<dyn DemuxerSource> {
            Box::new(MpegDemuxer::new())
        });

        registry.register_output(
            OutputKind::Video,
            file_or_null(OutputKind::Video, config.video_dump.clone()),
        );
        Self::register_audio_output(&mut registry, config);

        #[cfg(feature = "ffmpeg")]
        {
            use crate::player::decoder::FfmpegCodec;
            for id in [
                CodecId::Mpeg2Video,
                CodecId::Mp3,
                CodecId::Ac3,
                CodecId::Dts,
                CodecId::DvdSubpicture,
            ] {
                registry.register_codec(id, |id| -> Result<Box<dyn Codec>> {
                    Ok(Box::new(FfmpegCodec::new(id)?))
                });
            }
            registry.set_colorspace(|key| -> Result<Box<dyn Colorspace>> {
                Ok(Box::new(crate::player::colorspace::SwsColorspace::new(key)?))
            });
        }
        #[cfg(not(feature = "ffmpeg"))]
        registry.set_colorspace(|key| -> Result<Box<dyn Colorspace>> {
            Ok(Box::new(crate::player::colorspace::SoftwareColorspace::new(key)?))
        });

        info!(
            "📦 已注册模块: {} 个输入, {} 个解复用器, {} 个编解码器, {} 个输出",
            registry.inputs.len(),
            registry.demuxers.len(),
            registry.codecs.len(),
            registry.outputs.len()
        );
        registry
    }

    #[cfg(feature = "audio")]
    fn register_audio_output(registry: &mut Self, config: &EngineConfig) {
        match &config.audio_dump {
            Some(path) => registry.register_output(
                OutputKind::Audio,
                file_or_null(OutputKind::Audio, Some(path.clone())),
            ),
            None => registry.register_output(OutputKind::Audio, || -> Result<Box<dyn Output>> {
                Ok(Box::new(crate::player::audio_output::CpalOutput::new()))
            }),
        }
    }

    #[cfg(not(feature = "audio"))]
    fn register_audio_output(registry: &mut Self, config: &EngineConfig) {
        registry.register_output(
            OutputKind::Audio,
            file_or_null(OutputKind::Audio, config.audio_dump.clone()),
        );
    }

    pub fn register_input<F>(&mut self, protocol: &str, ctor: F)
    where
        F: Fn() -> Box<dyn Input> + Send + Sync + 'static,
    {
        debug!("注册输入模块: {}", protocol);
        self.inputs.insert(protocol.to_string(), Box::new(ctor));
    }

    pub fn register_output<F>(&mut self, kind: OutputKind, ctor: F)
    where
        F: Fn() -> Result<Box<dyn Output>> + Send + Sync + 'static,
    {
        debug!("注册输出模块: {:?}", kind);
        self.outputs.insert(kind, Box::new(ctor));
    }

    pub fn register_demuxer<F>(&mut self, format: ContainerFormat, ctor: F)
    where
        F: Fn() -> Box<dyn DemuxerSource> + Send + Sync + 'static,
    {
        debug!("注册解复用模块: {:?}", format);
        self.demuxers.insert(format, Box::new(ctor));
    }

    pub fn register_codec<F>(&mut self, id: CodecId, ctor: F)
    where
        F: Fn(CodecId) -> Result<Box<dyn Codec>> + Send + Sync + 'static,
    {
        debug!("注册编解码模块: {}", id.description());
        self.codecs.insert(id, Box::new(ctor));
    }

    pub fn set_colorspace<F>(&mut self, ctor: F)
    where
        F: Fn(ColorspaceKey) -> Result<Box<dyn Colorspace>> + Send + Sync + 'static,
    {
        self.colorspace = Some(Box::new(ctor));
    }

    pub fn create_input(&self, protocol: &str) -> Result<Box<dyn Input>> {
        let ctor = self.inputs.get(protocol).ok_or_else(|| {
            engine_error!(
                ErrorDomain::Modules,
                ModulesErrorCode::NoProtocol,
                MODULE,
                "Cannot find a module which supports the protocol '{}'",
                protocol
            )
        })?;
        Ok(ctor())
    }

    pub fn create_output(&self, kind: OutputKind) -> Result<Box<dyn Output>> {
        let ctor = self.outputs.get(&kind).ok_or_else(|| {
            engine_error!(
                ErrorDomain::Modules,
                ModulesErrorCode::NoOutput,
                MODULE,
                "Cannot find a module which supports the output type '{:?}'",
                kind
            )
        })?;
        ctor()
    }

    pub fn create_demuxer(&self, format: ContainerFormat) -> Result<Box<dyn DemuxerSource>> {
        let ctor = self.demuxers.get(&format).ok_or_else(|| {
            engine_error!(
                ErrorDomain::Modules,
                ModulesErrorCode::NoDemuxer,
                MODULE,
                "Cannot find a module which can demux '{:?}' data",
                format
            )
        })?;
        Ok(ctor())
    }

    pub fn create_codec(&self, id: CodecId) -> Result<Box<dyn Codec>> {
        let ctor = self.codecs.get(&id).ok_or_else(|| no_codec(id))?;
        ctor(id)
    }

    pub fn create_colorspace(&self, key: ColorspaceKey) -> Result<Box<dyn Colorspace>> {
        let ctor = self.colorspace.as_ref().ok_or_else(|| {
            engine_error!(
                ErrorDomain::Modules,
                ModulesErrorCode::NoCodec,
                MODULE,
                "Cannot find a colorspace module for {:?} -> {:?}",
                key.src,
                key.dst
            )
        })?;
        ctor(key)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn no_codec(id: CodecId) -> EngineError {
    engine_error!(
        ErrorDomain::Modules,
        ModulesErrorCode::NoCodec,
        MODULE,
        "Cannot find a module which supports the codec '{}'",
        id.description()
    )
}

/// 有转储路径时写文件，否则丢弃
fn file_or_null(
    kind: OutputKind,
    path: Option<std::path::PathBuf>,
) -> impl Fn() -> Result<Box<dyn Output>> + Send + Sync + 'static {
    move || -> Result<Box<dyn Output>> {
        match &path {
            Some(path) => Ok(Box::new(FileOutput::new(kind, path.clone()))),
            None => Ok(Box::new(NullOutput::new(kind))),
        }
    }
}
