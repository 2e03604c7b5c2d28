use crate::core::{
    EngineError, ErrorDomain, Frame, OutputErrorCode, Result, SampleFormat, StreamInfo,
};
use crate::engine_error;
use crate::player::output::Output;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use crossbeam_channel::{bounded, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MODULE: &str = "output-audio-cpal";

/// 队列一直满着超过这个时间，认为声卡已经停止消费
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

fn failed(message: String) -> EngineError {
    engine_error!(ErrorDomain::Output, OutputErrorCode::Failed, MODULE, "{}", message)
}

/// 解码线程和 cpal 回调线程之间的样本队列
struct SampleBuffer {
    samples: SegQueue<f32>,
    capacity: AtomicUsize,
    alive: AtomicBool,
}

impl SampleBuffer {
    fn new() -> Self {
        Self {
            samples: SegQueue::new(),
            capacity: AtomicUsize::new(0),
            alive: AtomicBool::new(false),
        }
    }

    fn start(&self, capacity: usize) {
        self.clear();
        self.capacity.store(capacity, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
    }

    /// 设备停止：正在等待和之后的写入都立即失败
    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        while self.samples.pop().is_some() {}
    }

    fn pop(&self) -> Option<f32> {
        self.samples.pop()
    }

    /// 队列积压超过容量时等待回调取走样本，最多等 `timeout`
    fn push(&self, samples: &[f32], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.samples.len() > self.capacity.load(Ordering::Relaxed) {
            if !self.is_alive() {
                return Err(failed("音频设备已停止".to_string()));
            }
            if Instant::now() >= deadline {
                return Err(failed(format!("音频设备 {:?} 内没有消费样本", timeout)));
            }
            thread::sleep(Duration::from_millis(5));
        }
        if !self.is_alive() {
            return Err(failed("音频设备已停止".to_string()));
        }
        for &sample in samples {
            self.samples.push(sample);
        }
        Ok(())
    }
}

/// 持有 cpal 流的线程；cpal::Stream 不是 Send，创建、播放和销毁都在这个线程上
struct StreamThread {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            error!("❌ 音频线程 panic");
        }
    }
}

/// 声卡输出（cpal）
///
/// 解码线程写入 S16 交错样本，转换为 f32 后放入无锁队列，由 cpal 回调线程取走。
/// 队列中积压超过约一秒的样本时写入方阻塞，相当于阻塞式写声卡；设备报错或
/// 长时间不消费时写入返回错误。
pub struct CpalOutput {
    thread: Option<StreamThread>,
    buffer: Arc<SampleBuffer>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self {
            thread: None,
            buffer: Arc::new(SampleBuffer::new()),
        }
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0
            && config.channels == supported.channels()
    }

    /// 在音频线程上打开设备并开始播放
    fn play(config: StreamConfig, buffer: Arc<SampleBuffer>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| failed("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let supported = device
            .supported_output_configs()
            .map_err(|e| failed(format!("无法获取支持的音频配置: {}", e)))?
            .any(|range| Self::is_config_compatible(&config, &range));
        if !supported {
            // 没有重采样，只能如实报告
            warn!(
                "⚠️  音频设备不支持 {} Hz, {} 声道，仍尝试打开",
                config.sample_rate.0, config.channels
            );
        }

        let source = buffer.clone();
        let output = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = source.pop().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                    buffer.shutdown();
                },
                None,
            )
            .map_err(|e| failed(format!("创建音频流失败: {}", e)))?;
        output
            .play()
            .map_err(|e| failed(format!("启动音频流失败: {}", e)))?;
        Ok(output)
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for CpalOutput {
    fn open(&mut self, stream: &StreamInfo) -> Result<()> {
        let properties = stream.properties;
        if properties.sample_format != SampleFormat::S16 {
            return Err(failed(format!("不支持的采样格式 {:?}", properties.sample_format)));
        }
        if let Some(thread) = self.thread.take() {
            thread.stop();
        }

        let channels = properties.channels.max(1);
        let sample_rate = if properties.sample_rate > 0 { properties.sample_rate } else { 48_000 };
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        self.buffer.start(sample_rate as usize * channels as usize);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let buffer = self.buffer.clone();
        let handle = thread::Builder::new()
            .name("myy-cpal".to_string())
            .spawn(move || {
                let output = match Self::play(config, buffer) {
                    Ok(output) => output,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // 发送端发送或被丢弃都会唤醒
                let _ = stop_rx.recv();
                drop(output);
                debug!("音频流已销毁");
            })
            .map_err(|e| failed(format!("无法创建音频线程: {}", e)))?;

        let thread = StreamThread {
            stop: stop_tx,
            handle,
        };
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.thread = Some(thread);
                info!("🔊 音频输出已启动");
                Ok(())
            }
            Ok(Err(e)) => {
                self.buffer.shutdown();
                thread.stop();
                Err(e)
            }
            Err(_) => {
                self.buffer.shutdown();
                thread.stop();
                Err(failed("音频线程意外退出".to_string()))
            }
        }
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.thread.is_none() {
            return Err(failed("输出设备尚未打开".to_string()));
        }
        let Frame::Audio(audio) = frame else {
            return Err(failed(format!("音频输出收到 {} 帧", frame.kind())));
        };

        let samples: Vec<f32> = audio
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        self.buffer.push(&samples, STALL_TIMEOUT)
    }

    fn close(&mut self) {
        self.buffer.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.stop();
            self.buffer.clear();
            info!("音频输出已停止");
        }
    }

    fn description(&self) -> String {
        "cpal audio output".to_string()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}
