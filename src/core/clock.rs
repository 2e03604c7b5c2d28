use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// PES 时间戳频率（90 kHz）
pub const PTS_CLOCK_HZ: f64 = 90_000.0;

/// 将 90 kHz 时间戳换算为秒
pub fn pts_to_seconds(pts: i64) -> f64 {
    pts as f64 / PTS_CLOCK_HZ
}

/// 呈现时钟 - 把流时间戳锚定到墙上时钟
///
/// 第一次查询时记录 (当前时刻, 该 PTS) 作为基准，之后的 PTS 按与基准 PTS 的差值换算，
/// 所以节目流的 PTS 不必从 0 开始。不做漂移校正。
#[derive(Clone)]
pub struct PresentationClock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    base: Option<(Instant, i64)>,
}

impl PresentationClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner { base: None })),
        }
    }

    /// 距离该 PTS 应当呈现还有多少秒（负数表示已经迟到）
    pub fn delay(&self, pts: i64) -> f64 {
        self.delay_at(pts, Instant::now())
    }

    /// 同 [`delay`](Self::delay)，但由调用方给出当前时刻
    pub fn delay_at(&self, pts: i64, now: Instant) -> f64 {
        let mut inner = self.inner.lock();
        let (base, base_pts) = *inner.base.get_or_insert((now, pts));

        // now 早于 base 时 elapsed 记为 0
        let elapsed = now.saturating_duration_since(base).as_secs_f64();
        pts_to_seconds(pts - base_pts) - elapsed
    }

    /// 是否已经锚定
    pub fn is_started(&self) -> bool {
        self.inner.lock().base.is_some()
    }

    /// 忘记基准时刻，下一次查询重新锚定
    pub fn reset(&self) {
        self.inner.lock().base = None;
    }
}

impl Default for PresentationClock {
    fn default() -> Self {
        Self::new()
    }
}
