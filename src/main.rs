use crossbeam_channel::RecvTimeoutError;
use log::info;
use myy_engine::core::{EngineConfig, EngineError};
use myy_engine::player::{Engine, EngineEvent, ModuleRegistry};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    // 初始化日志（RUST_LOG 可覆盖默认级别）
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        let program = args.first().map(String::as_str).unwrap_or("myy_engine");
        eprintln!("Usage: {} <protocol> <uri>", program);
        eprintln!("  e.g. {} file movie.mpg", program);
        process::exit(1);
    }

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR - config: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(err) = run(config, &args[1], &args[2]) {
        println!("ERROR - {}: {}", err.module, err.message);
        process::exit(err.code);
    }
}

fn run(config: EngineConfig, protocol: &str, uri: &str) -> Result<(), EngineError> {
    #[cfg(feature = "ffmpeg")]
    {
        ffmpeg_next::init()?;
        info!("✅ FFmpeg 初始化成功");
    }

    info!("🎬 MYY Engine 启动");
    let play_for = Duration::from_secs(config.play_seconds);
    let registry = Arc::new(ModuleRegistry::with_defaults(&config));
    println!("Creating engine ...");
    let mut engine = Engine::new(config, registry)?;

    println!("Opening {}://{} ...", protocol, uri);
    engine.open(protocol, uri)?;

    println!("Playing for {} seconds ...", play_for.as_secs());
    engine.play()?;

    let events = engine.events();
    let deadline = Instant::now() + play_for;
    let mut failure = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(EngineEvent::NewStream(stream)) => println!(
                "New stream 0x{:x}: {} ({})",
                stream.id,
                stream.codec.description(),
                if stream.active { "active" } else { "ignored" }
            ),
            Ok(EngineEvent::EndOfStream) => {
                println!("End of stream");
                // 队列中剩余的帧处理完再关闭
                engine.wait()?;
                break;
            }
            Ok(EngineEvent::Error(err)) if err.is_fatal() => {
                failure = Some(err);
                break;
            }
            Ok(EngineEvent::Error(err)) => println!("Warning - {}: {}", err.module, err.message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    println!("Closing ...");
    engine.close();
    match serde_json::to_string(&engine.stats()) {
        Ok(stats) => println!("Stats: {}", stats),
        Err(e) => info!("统计序列化失败: {}", e),
    }

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
