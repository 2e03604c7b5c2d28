use crate::core::{
    CodecErrorCode, EngineConfig, EngineError, EngineErrorCode, EngineState, EngineStats,
    ErrorDomain, Frame, MediaType, PixelFormat, PresentationClock, RawFrame, Result, StreamInfo,
};
use crate::engine_error;
use crate::player::colorspace::{Colorspace, ColorspaceKey};
use crate::player::input::{InputListener, MediaInput};
use crate::player::output::{Output, OutputKind};
use crate::player::queue::BlockingQueue;
use crate::player::registry::ModuleRegistry;
use crate::player::stream::Stream;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const MODULE: &str = "engine";

/// 节奏控制时每次休眠的粒度，保证 close() 能及时唤醒视频线程
const PACE_SLICE: Duration = Duration::from_millis(10);

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 引擎对外发布的事件
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// 发现一条新流（active 表示是否成为该类型的活动流）
    NewStream(StreamInfo),
    EndOfStream,
    /// 管线中出现的错误（可恢复错误只跳过当前帧）
    Error(EngineError),
}

/// 路由线程交给工作线程的工作项
enum WorkItem {
    /// 激活流：之后的帧都用它解码
    Activate {
        stream: Arc<Stream>,
        converter: Option<Box<dyn Colorspace>>,
    },
    Frame(RawFrame),
    /// 流结束，工作线程处理完队列中剩余的帧后退出
    EndOfStream,
}

type SharedOutput = Arc<Mutex<Box<dyn Output>>>;

#[derive(Default)]
struct Counters {
    audio_routed: AtomicU64,
    video_routed: AtomicU64,
    subtitle_routed: AtomicU64,
    dropped: AtomicU64,
    audio_presented: AtomicU64,
    video_presented: AtomicU64,
    subtitle_presented: AtomicU64,
    recoverable_errors: AtomicU64,
    events_dropped: AtomicU64,
}

impl Counters {
    fn routed(&self, media: MediaType) -> Option<&AtomicU64> {
        match media {
            MediaType::Audio => Some(&self.audio_routed),
            MediaType::Video => Some(&self.video_routed),
            MediaType::Subtitle => Some(&self.subtitle_routed),
            MediaType::Unknown => None,
        }
    }

    fn presented(&self, media: MediaType) -> Option<&AtomicU64> {
        match media {
            MediaType::Audio => Some(&self.audio_presented),
            MediaType::Video => Some(&self.video_presented),
            MediaType::Subtitle => Some(&self.subtitle_presented),
            MediaType::Unknown => None,
        }
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            audio_routed: self.audio_routed.load(Ordering::Relaxed),
            video_routed: self.video_routed.load(Ordering::Relaxed),
            subtitle_routed: self.subtitle_routed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            audio_presented: self.audio_presented.load(Ordering::Relaxed),
            video_presented: self.video_presented.load(Ordering::Relaxed),
            subtitle_presented: self.subtitle_presented.load(Ordering::Relaxed),
            recoverable_errors: self.recoverable_errors.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

/// 路由线程和工作线程共享的状态
struct Shared {
    config: EngineConfig,
    registry: Arc<ModuleRegistry>,
    audio_queue: BlockingQueue<WorkItem>,
    video_queue: BlockingQueue<WorkItem>,
    subtitle_queue: BlockingQueue<WorkItem>,
    audio_output: SharedOutput,
    video_output: SharedOutput,
    clock: PresentationClock,
    counters: Counters,
    running: AtomicBool,
    eos: AtomicBool,
    events: Sender<EngineEvent>,
}

impl Shared {
    fn queue(&self, media: MediaType) -> Option<&BlockingQueue<WorkItem>> {
        match media {
            MediaType::Audio => Some(&self.audio_queue),
            MediaType::Video => Some(&self.video_queue),
            MediaType::Subtitle => Some(&self.subtitle_queue),
            MediaType::Unknown => None,
        }
    }

    fn queues(&self) -> [&BlockingQueue<WorkItem>; 3] {
        [&self.audio_queue, &self.video_queue, &self.subtitle_queue]
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 记录错误并发布到事件通道
    fn report(&self, err: EngineError) {
        if err.is_fatal() {
            error!("{} ❌ {}", log_ctx(), err);
        } else {
            warn!("{} ⚠ 跳过: {}", log_ctx(), err);
            self.counters.recoverable_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.publish(EngineEvent::Error(err));
    }

    /// 发布事件；通道满（没有人消费）时丢弃并计数，不阻塞管线
    fn publish(&self, event: EngineEvent) {
        if self.events.try_send(event).is_err() {
            let dropped = self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
            if dropped == 0 {
                warn!("{} ⚠ 事件通道已满，后续事件将被丢弃", log_ctx());
            }
        }
    }
}

/// 路由线程上的流选择和帧分发
///
/// 每种媒体类型只激活第一条流。激活信息和帧走同一个队列，工作线程不需要读共享的流表。
struct FrameRouter<'a> {
    shared: &'a Shared,
    audio: Option<u32>,
    video: Option<u32>,
    subtitle: Option<u32>,
    finished: bool,
}

impl<'a> FrameRouter<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            audio: None,
            video: None,
            subtitle: None,
            finished: false,
        }
    }

    fn active_slot(&mut self, media: MediaType) -> Option<&mut Option<u32>> {
        match media {
            MediaType::Audio => Some(&mut self.audio),
            MediaType::Video => Some(&mut self.video),
            MediaType::Subtitle => Some(&mut self.subtitle),
            MediaType::Unknown => None,
        }
    }

    fn media_of(&self, stream_id: u32) -> Option<MediaType> {
        if self.video == Some(stream_id) {
            Some(MediaType::Video)
        } else if self.audio == Some(stream_id) {
            Some(MediaType::Audio)
        } else if self.subtitle == Some(stream_id) {
            Some(MediaType::Subtitle)
        } else {
            None
        }
    }

    /// 打开输出设备，视频流另外创建色彩空间转换器
    fn activate(&self, stream: &Arc<Stream>) -> Result<Option<Box<dyn Colorspace>>> {
        let info = stream.info(true);
        match stream.media_type() {
            MediaType::Audio => {
                self.shared.audio_output.lock().open(&info)?;
                Ok(None)
            }
            MediaType::Video => {
                let properties = info.properties;
                let src = match properties.pixel_format {
                    PixelFormat::Unknown => PixelFormat::Yuv420p,
                    format => format,
                };
                let key = ColorspaceKey {
                    src,
                    dst: self.shared.config.video_pixel_format,
                    width: properties.width,
                    height: properties.height,
                };
                let converter = self.shared.registry.create_colorspace(key)?;
                self.shared.video_output.lock().open(&info)?;
                Ok(Some(converter))
            }
            _ => Ok(None),
        }
    }

    /// 把帧放入对应的队列；队列已关闭时返回 false
    fn route(&mut self, frame: RawFrame) -> bool {
        let Some(media) = self.media_of(frame.stream_id) else {
            trace!("丢弃未激活流 0x{:x} 的帧", frame.stream_id);
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        };
        let Some(queue) = self.shared.queue(media) else {
            return true;
        };
        if queue.enqueue_blocking(WorkItem::Frame(frame)).is_err() {
            debug!("{} {:?} 队列已关闭，停止路由", log_ctx(), media);
            return false;
        }
        if let Some(counter) = self.shared.counters.routed(media) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// 向所有工作线程发送结束标记（只发送一次）
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        for queue in self.shared.queues() {
            let _ = queue.enqueue_blocking(WorkItem::EndOfStream);
        }
    }
}

impl InputListener for FrameRouter<'_> {
    fn new_stream(&mut self, stream: &Arc<Stream>) {
        let media = stream.media_type();
        let already_active = match self.active_slot(media) {
            Some(slot) => slot.is_some(),
            None => return,
        };

        let mut active = false;
        if already_active {
            info!("{} 流 0x{:x} 不是第一条 {:?} 流，不激活", log_ctx(), stream.id(), media);
        } else {
            match self.activate(stream) {
                Ok(converter) => {
                    if let Some(queue) = self.shared.queue(media) {
                        let item = WorkItem::Activate {
                            stream: stream.clone(),
                            converter,
                        };
                        if queue.enqueue_blocking(item).is_ok() {
                            active = true;
                        }
                    }
                }
                Err(e) => self.shared.report(e),
            }
            if active {
                if let Some(slot) = self.active_slot(media) {
                    *slot = Some(stream.id());
                }
                info!(
                    "{} ▶ 激活 {:?} 流 0x{:x} ({})",
                    log_ctx(),
                    media,
                    stream.id(),
                    stream.codec_id().description()
                );
            }
        }

        self.shared.publish(EngineEvent::NewStream(stream.info(active)));
    }

    fn end_of_stream(&mut self) {
        info!("{} 📄 输入结束，通知工作线程", log_ctx());
        self.shared.eos.store(true, Ordering::SeqCst);
        self.finish();
        self.shared.publish(EngineEvent::EndOfStream);
    }
}

/// 路由线程：读取原始帧并分发，结束后把输入交还给引擎
fn router_loop(shared: Arc<Shared>, mut input: MediaInput) -> MediaInput {
    info!("{} 🎬 路由线程启动: {}", log_ctx(), input.uri());
    let mut router = FrameRouter::new(&shared);
    let mut frames: u64 = 0;

    while shared.is_running() {
        match input.read_frame(&mut router) {
            Ok(Some(frame)) => {
                frames += 1;
                if !router.route(frame) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                // 输入层已经跳过了单个坏包，到这里说明输入无法继续
                shared.report(e);
                router.finish();
                break;
            }
        }
    }

    info!("{} 🛑 路由线程退出（共 {} 帧）", log_ctx(), frames);
    input
}

/// 工作线程的解码状态
struct Worker {
    media: MediaType,
    stream: Option<Arc<Stream>>,
    converter: Option<Box<dyn Colorspace>>,
}

impl Worker {
    fn new(media: MediaType) -> Self {
        Self {
            media,
            stream: None,
            converter: None,
        }
    }

    fn run(&mut self, shared: &Shared) {
        let Some(queue) = shared.queue(self.media) else {
            return;
        };
        info!("{} 🔧 {:?} 工作线程启动", log_ctx(), self.media);

        while let Some(item) = queue.dequeue_blocking() {
            if !shared.is_running() {
                break;
            }
            match item {
                WorkItem::Activate { stream, converter } => {
                    debug!("{} {:?} 工作线程切换到流 0x{:x}", log_ctx(), self.media, stream.id());
                    self.stream = Some(stream);
                    self.converter = converter;
                }
                WorkItem::Frame(raw) => {
                    let result = self.present(shared, &raw);
                    self.check(shared, result);
                }
                WorkItem::EndOfStream => {
                    self.flush(shared);
                    break;
                }
            }
        }

        info!("{} 🛑 {:?} 工作线程退出", log_ctx(), self.media);
    }

    fn check(&mut self, shared: &Shared, result: Result<()>) {
        if let Err(e) = result {
            let fatal = e.is_fatal();
            shared.report(e);
            if fatal {
                // 之后的帧直接丢弃，继续消费队列直到结束标记
                self.stream = None;
            }
        }
    }

    /// 输入结束：取出编解码器里缓存的帧并全部呈现（不做节奏控制）
    fn flush(&mut self, shared: &Shared) {
        let Some(stream) = self.stream.clone() else {
            return;
        };
        let frames = match stream.flush() {
            Ok(frames) => frames,
            Err(e) => {
                self.check(shared, Err(e));
                return;
            }
        };
        if !frames.is_empty() {
            debug!("{} {:?} 流结束冲刷 {} 帧", log_ctx(), self.media, frames.len());
        }
        for frame in frames {
            let result = self.deliver(shared, &frame, None);
            self.check(shared, result);
        }
    }

    fn present(&mut self, shared: &Shared, raw: &RawFrame) -> Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        let Some(frame) = stream.decode(raw)? else {
            trace!("流 0x{:x} 暂无输出 (pts {})", raw.stream_id, raw.pts);
            return Ok(());
        };
        self.deliver(shared, &frame, Some(raw.pts))
    }

    /// 把解码后的帧写到输出；`pts` 为 None 时视频不做节奏控制
    fn deliver(&mut self, shared: &Shared, frame: &Frame, pts: Option<i64>) -> Result<()> {
        let media = self.media;
        match media {
            MediaType::Audio => shared.audio_output.lock().write(frame)?,
            MediaType::Video => {
                if let Some(pts) = pts {
                    pace(shared, pts);
                }
                let converter = self.converter.as_mut().ok_or_else(|| {
                    engine_error!(
                        ErrorDomain::Engine,
                        EngineErrorCode::InvalidState,
                        MODULE,
                        "{:?} 流没有色彩空间转换器",
                        media
                    )
                })?;
                let converted = converter.convert(frame)?;
                shared.video_output.lock().write(&converted)?;
            }
            MediaType::Subtitle => {
                let converted = self.convert_subtitle(shared, frame)?;
                shared.video_output.lock().write_overlay(&converted)?;
            }
            MediaType::Unknown => return Ok(()),
        }

        if let Some(counter) = shared.counters.presented(self.media) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// 转换器按 (源格式, 目标格式, 尺寸) 缓存，只有尺寸或格式变化时才重建
    fn convert_subtitle(&mut self, shared: &Shared, frame: &Frame) -> Result<Frame> {
        let Frame::Subtitle(sub) = frame else {
            return Err(engine_error!(
                ErrorDomain::Codec,
                CodecErrorCode::Failed,
                MODULE,
                "字幕流解码出了 {} 帧",
                frame.kind()
            ));
        };
        let key = ColorspaceKey {
            src: sub.format,
            dst: shared.config.video_pixel_format,
            width: sub.width,
            height: sub.height,
        };

        let converter = match self.converter.take() {
            Some(converter) if converter.key() == key => converter,
            _ => {
                debug!("字幕转换器重建: {}x{} {:?}", key.width, key.height, key.src);
                shared.registry.create_colorspace(key)?
            }
        };
        self.converter.insert(converter).convert(frame)
    }
}

/// 按 PTS 控制视频呈现节奏
fn pace(shared: &Shared, pts: i64) {
    let delay = shared.clock.delay(pts);
    let config = &shared.config;
    if !config.pace_video || delay * 1000.0 <= config.pace_threshold_ms as f64 {
        return;
    }

    let mut remaining =
        Duration::from_secs_f64(delay).min(Duration::from_millis(config.max_pace_ms));
    trace!("视频帧 pts {} 等待 {:?}", pts, remaining);
    while !remaining.is_zero() && shared.is_running() {
        let step = remaining.min(PACE_SLICE);
        thread::sleep(step);
        remaining -= step;
    }
}

fn invalid_state(operation: &str, state: EngineState) -> EngineError {
    engine_error!(
        ErrorDomain::Engine,
        EngineErrorCode::InvalidState,
        MODULE,
        "Cannot {} while the engine is {:?}",
        operation,
        state
    )
}

fn spawn<T, F>(name: &str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| {
            engine_error!(
                ErrorDomain::Engine,
                EngineErrorCode::Thread,
                MODULE,
                "无法创建线程 {}: {}",
                name,
                e
            )
        })
}

/// 播放引擎
///
/// 状态：Created -> Opened -> Playing -> Closed
///
/// `play()` 启动四个线程：
/// - myy-router: 读取输入、发现新流、把原始帧分发到各类型的队列
/// - myy-audio / myy-video / myy-subtitle: 解码、转换并写入输出设备
///
/// 队列有界（`queue_capacity`），工作线程处理慢时路由线程会阻塞，从而对解复用形成背压。
pub struct Engine {
    state: EngineState,
    shared: Arc<Shared>,
    events: Receiver<EngineEvent>,
    input: Option<MediaInput>,
    router: Option<JoinHandle<MediaInput>>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// 创建引擎并通过注册表创建音视频输出
    pub fn new(config: EngineConfig, registry: Arc<ModuleRegistry>) -> Result<Self> {
        let audio_output = registry.create_output(OutputKind::Audio)?;
        let video_output = registry.create_output(OutputKind::Video)?;
        info!(
            "🎛 引擎创建: 音频输出 {}, 视频输出 {}",
            audio_output.description(),
            video_output.description()
        );

        let (events_tx, events_rx) = bounded(config.event_capacity);
        let capacity = config.queue_capacity;
        let shared = Shared {
            config,
            registry,
            audio_queue: BlockingQueue::new(capacity),
            video_queue: BlockingQueue::new(capacity),
            subtitle_queue: BlockingQueue::new(capacity),
            audio_output: Arc::new(Mutex::new(audio_output)),
            video_output: Arc::new(Mutex::new(video_output)),
            clock: PresentationClock::new(),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            eos: AtomicBool::new(false),
            events: events_tx,
        };

        Ok(Self {
            state: EngineState::Created,
            shared: Arc::new(shared),
            events: events_rx,
            input: None,
            router: None,
            workers: Vec::new(),
        })
    }

    /// 按协议打开输入并创建解复用器
    pub fn open(&mut self, protocol: &str, uri: &str) -> Result<()> {
        if self.state != EngineState::Created {
            return Err(invalid_state("open", self.state));
        }
        let input = MediaInput::open(
            self.shared.registry.clone(),
            &self.shared.config,
            protocol,
            uri,
        )?;
        self.input = Some(input);
        self.state = EngineState::Opened;
        info!("✅ 引擎已打开 {}://{}", protocol, uri);
        Ok(())
    }

    /// 启动路由线程和三个工作线程，立即返回
    pub fn play(&mut self) -> Result<()> {
        if self.state != EngineState::Opened {
            return Err(invalid_state("play", self.state));
        }
        let input = self
            .input
            .take()
            .ok_or_else(|| invalid_state("play without input", self.state))?;

        self.shared.running.store(true, Ordering::SeqCst);
        self.state = EngineState::Playing;

        for (name, media) in [
            ("myy-audio", MediaType::Audio),
            ("myy-video", MediaType::Video),
            ("myy-subtitle", MediaType::Subtitle),
        ] {
            let shared = self.shared.clone();
            match spawn(name, move || Worker::new(media).run(&shared)) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.input = Some(input);
                    self.close();
                    return Err(e);
                }
            }
        }

        let shared = self.shared.clone();
        match spawn("myy-router", move || router_loop(shared, input)) {
            Ok(handle) => self.router = Some(handle),
            Err(e) => {
                self.close();
                return Err(e);
            }
        }

        info!("▶ 开始播放");
        Ok(())
    }

    pub fn pause(&self) {
        info!("⏸ 暂停尚未实现，忽略");
    }

    pub fn stop(&self) {
        info!("⏹ 停止尚未实现，忽略（使用 close 结束播放）");
    }

    /// 等待输入自然结束、所有线程处理完剩余的帧
    pub fn wait(&mut self) -> Result<()> {
        if self.state != EngineState::Playing {
            return Err(invalid_state("wait", self.state));
        }
        self.join_threads();
        Ok(())
    }

    fn join_threads(&mut self) {
        if let Some(router) = self.router.take() {
            match router.join() {
                Ok(input) => self.input = Some(input),
                Err(_) => error!("❌ 路由线程 panic"),
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("❌ 工作线程 panic");
            }
        }
    }

    /// 停止所有线程并关闭输入和输出；可重复调用
    pub fn close(&mut self) {
        if self.state == EngineState::Closed {
            return;
        }
        info!("🛑 关闭引擎 (状态 {:?})", self.state);

        self.shared.running.store(false, Ordering::SeqCst);
        for queue in self.shared.queues() {
            queue.close();
        }
        self.join_threads();

        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.shared.audio_output.lock().close();
        self.shared.video_output.lock().close();

        self.state = EngineState::Closed;
        debug!("引擎统计: {:?}", self.stats());
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// 事件接收端（可以 clone 给多个消费者）；通道容量为 `event_capacity`，满了之后新事件被丢弃
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.counters.snapshot()
    }

    /// 输入是否已到达流末尾
    pub fn is_eos(&self) -> bool {
        self.shared.eos.load(Ordering::SeqCst)
            || self.input.as_ref().is_some_and(|input| input.is_eos())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state != EngineState::Closed {
            warn!("{} ⚠ Engine 被 drop 但未调用 close()，正在关闭", log_ctx());
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AudioFrame, CodecId, ModulesErrorCode};
    use crate::player::testing::{
        late_size_registry, pes_mpeg2, pes_private, recording_registry, test_registry, OutputEvent,
        ScriptedCodec,
    };
    use std::time::Instant;

    fn test_config() -> EngineConfig {
        EngineConfig {
            pace_video: false,
            ..EngineConfig::default()
        }
    }

    fn play_to_end(registry: ModuleRegistry, config: EngineConfig) -> Engine {
        let mut engine = Engine::new(config, Arc::new(registry)).unwrap();
        engine.open("memory", "test").unwrap();
        engine.play().unwrap();
        engine.wait().unwrap();
        engine
    }

    fn video_luma(log: &[OutputEvent]) -> Vec<u8> {
        log.iter()
            .filter_map(|e| match e {
                OutputEvent::Frame(OutputKind::Video, Frame::Video(v)) => Some(v.data[0][0]),
                _ => None,
            })
            .collect()
    }

    fn audio_payloads(log: &[OutputEvent]) -> Vec<Vec<u8>> {
        log.iter()
            .filter_map(|event| match event {
                OutputEvent::Frame(OutputKind::Audio, Frame::Audio(AudioFrame { data })) => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_end_to_end_opens_outputs_and_reaches_eos() {
        let mut stream = pes_mpeg2(0xE0, Some((3_600, 3_600)), &[0x10]);
        stream.extend(pes_mpeg2(0xC0, Some((3_600, 3_600)), &[1]));
        stream.extend(pes_mpeg2(0xE0, Some((7_200, 7_200)), &[0x20]));
        stream.extend(pes_mpeg2(0xC0, Some((7_200, 7_200)), &[2]));

        let (registry, log) = recording_registry(stream);
        let mut engine = play_to_end(registry, test_config());
        assert!(engine.is_eos());

        let events: Vec<EngineEvent> = engine.events().try_iter().collect();
        assert_eq!(events.last(), Some(&EngineEvent::EndOfStream));
        let new_streams: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::NewStream(info) if info.active => Some(info.id),
                _ => None,
            })
            .collect();
        assert_eq!(new_streams, vec![0x1E0, 0x1C0]);

        let entries = log.lock().clone();
        let opened: Vec<&StreamInfo> = entries
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Opened(_, info) => Some(info),
                _ => None,
            })
            .collect();
        assert_eq!(opened.len(), 2);
        assert_eq!(
            opened[0].properties,
            ScriptedCodec::properties_for(CodecId::Mpeg2Video)
        );
        assert_eq!(opened[1].properties, ScriptedCodec::properties_for(CodecId::Mp3));

        assert_eq!(audio_payloads(&entries), vec![vec![1], vec![2]]);
        assert_eq!(video_luma(&entries), vec![0x10, 0x20]);

        let stats = engine.stats();
        assert_eq!((stats.video_routed, stats.audio_routed), (2, 2));
        assert_eq!((stats.video_presented, stats.audio_presented), (2, 2));
        assert_eq!(stats.dropped, 0);

        engine.close();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(log.lock().contains(&OutputEvent::Closed(OutputKind::Video)));
    }

    #[test]
    fn test_only_first_stream_of_a_type_is_activated() {
        let mut stream = pes_mpeg2(0xC0, None, &[1]);
        stream.extend(pes_mpeg2(0xC1, None, &[100]));
        stream.extend(pes_mpeg2(0xC0, None, &[2]));
        stream.extend(pes_mpeg2(0xC1, None, &[101]));

        let (registry, log) = recording_registry(stream);
        let engine = play_to_end(registry, test_config());

        let entries = log.lock().clone();
        let opened: Vec<u32> = entries
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Opened(OutputKind::Audio, info) => Some(info.id),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec![0x1C0]);
        assert_eq!(audio_payloads(&entries), vec![vec![1], vec![2]]);

        let second = engine.events().try_iter().find_map(|e| match e {
            EngineEvent::NewStream(info) if info.id == 0x1C1 => Some(info),
            _ => None,
        });
        assert!(!second.unwrap().active);
        assert_eq!(engine.stats().dropped, 2);
        assert_eq!(engine.stats().audio_routed, 2);
    }

    #[test]
    fn test_decode_errors_skip_the_frame() {
        let mut stream = pes_mpeg2(0xE0, None, &[0xEE]);
        stream.extend(pes_mpeg2(0xE0, None, &[0x30]));
        stream.extend(pes_mpeg2(0xE0, None, &[0xDD]));

        let engine = play_to_end(test_registry(stream), test_config());
        let stats = engine.stats();
        assert_eq!(stats.video_routed, 3);
        assert_eq!(stats.video_presented, 1);
        assert_eq!(stats.recoverable_errors, 1);

        let error = engine.events().try_iter().find_map(|e| match e {
            EngineEvent::Error(err) => Some(err),
            _ => None,
        });
        let error = error.unwrap();
        assert_eq!(error.domain, ErrorDomain::Codec);
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_video_activates_once_size_is_known() {
        let mut stream = Vec::new();
        for i in 1..=5u8 {
            stream.extend(pes_mpeg2(0xE0, None, &[i]));
        }

        let (registry, log) = late_size_registry(stream, 2);
        let engine = play_to_end(registry, test_config());

        let entries = log.lock().clone();
        let opened: Vec<&StreamInfo> = entries
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Opened(OutputKind::Video, info) => Some(info),
                _ => None,
            })
            .collect();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].properties.width, 16);
        assert_eq!(opened[0].properties.height, 16);
        assert_eq!(video_luma(&entries), vec![3, 4, 5]);

        let stats = engine.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!((stats.video_routed, stats.video_presented), (3, 3));
        assert_eq!(stats.recoverable_errors, 0);
        let active = engine.events().try_iter().any(|e| {
            matches!(e, EngineEvent::NewStream(info) if info.id == 0x1E0 && info.active)
        });
        assert!(active);
    }

    #[test]
    fn test_events_are_dropped_when_nobody_listens() {
        let mut stream = Vec::new();
        for _ in 0..500 {
            stream.extend(pes_mpeg2(0xE0, None, &[0xEE]));
        }
        let config = EngineConfig {
            event_capacity: 16,
            ..test_config()
        };

        let mut engine = play_to_end(test_registry(stream), config);
        let stats = engine.stats();
        assert_eq!(stats.recoverable_errors, 500);
        // 1 个 NewStream、500 个错误和 EndOfStream，只保留最先的 16 个
        assert_eq!(stats.events_dropped, 501 + 1 - 16);
        let events: Vec<EngineEvent> = engine.events().try_iter().collect();
        assert_eq!(events.len(), 16);
        assert!(matches!(events[0], EngineEvent::NewStream(_)));
        engine.close();
    }

    #[test]
    fn test_end_of_stream_flushes_held_frames() {
        let mut stream = pes_mpeg2(0xE0, Some((3_600, 3_600)), &[0x10]);
        stream.extend(pes_mpeg2(0xE0, Some((7_200, 7_200)), &[0xCC]));
        stream.extend(pes_mpeg2(0xC0, None, &[0xCC, 9]));

        let (registry, log) = recording_registry(stream);
        let engine = play_to_end(registry, test_config());

        let entries = log.lock().clone();
        assert_eq!(video_luma(&entries), vec![0x10, 0xCC]);
        assert_eq!(audio_payloads(&entries), vec![vec![0xCC, 9]]);
        let stats = engine.stats();
        assert_eq!((stats.video_routed, stats.video_presented), (2, 2));
        assert_eq!(stats.audio_presented, 1);
    }

    #[test]
    fn test_subtitles_are_converted_to_overlays() {
        let mut stream = pes_private(0x20, &[1]);
        stream.extend(pes_private(0x20, &[2]));

        let (registry, log) = recording_registry(stream);
        let engine = play_to_end(registry, test_config());

        let overlays: Vec<Frame> = log
            .lock()
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Overlay(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(overlays.len(), 2);
        let Frame::Subtitle(sub) = &overlays[0] else {
            panic!("expected subtitle overlay");
        };
        assert_eq!((sub.x, sub.y, sub.width, sub.height), (2, 3, 4, 2));
        assert_eq!(sub.format, PixelFormat::Yuv420p);
        assert_eq!(engine.stats().subtitle_presented, 2);
    }

    #[test]
    fn test_close_wakes_blocked_threads() {
        // 每帧相隔一秒并开启节奏控制：视频线程会休眠，路由线程很快被队列阻塞
        let mut stream = Vec::new();
        for i in 0..50 {
            stream.extend(pes_mpeg2(0xE0, Some((i * 90_000, i * 90_000)), &[i as u8]));
        }
        let config = EngineConfig {
            queue_capacity: 2,
            pace_video: true,
            ..EngineConfig::default()
        };

        let mut engine = Engine::new(config, Arc::new(test_registry(stream))).unwrap();
        engine.open("memory", "test").unwrap();
        engine.play().unwrap();
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        engine.close();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(!engine.is_eos());
        assert!(engine.stats().video_presented < 50);

        // 重复关闭无副作用
        engine.close();
    }

    #[test]
    fn test_state_transitions_are_checked() {
        let mut engine =
            Engine::new(test_config(), Arc::new(test_registry(pes_mpeg2(0xE0, None, &[1])))).unwrap();
        let err = engine.play().unwrap_err();
        assert_eq!(err.code, EngineErrorCode::InvalidState as i32);

        engine.open("memory", "test").unwrap();
        assert!(engine.open("memory", "test").is_err());
        engine.play().unwrap();
        let err = engine.play().unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Engine);
        assert_eq!(err.code, EngineErrorCode::InvalidState as i32);

        engine.wait().unwrap();
        engine.close();
        assert!(engine.wait().is_err());
    }

    #[test]
    fn test_open_unknown_protocol_keeps_engine_created() {
        let mut engine = Engine::new(test_config(), Arc::new(test_registry(Vec::new()))).unwrap();
        let err = engine.open("rtsp", "rtsp://example").unwrap_err();
        assert_eq!(err.domain, ErrorDomain::Modules);
        assert_eq!(err.code, ModulesErrorCode::NoProtocol as i32);
        assert_eq!(engine.state(), EngineState::Created);
    }

    #[test]
    fn test_missing_output_module_fails_creation() {
        let registry = ModuleRegistry::new();
        let err = Engine::new(test_config(), Arc::new(registry)).err().unwrap();
        assert_eq!(err.code, ModulesErrorCode::NoOutput as i32);
    }
}
