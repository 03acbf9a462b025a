//! 进度节流器
//!
//! 控制进度回报频率：满足最小百分比步进或最小时间间隔之一才放行。
//! 原子操作实现，无锁竞争。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 进度节流器
#[derive(Debug)]
pub struct ProgressThrottle {
    /// 单调时钟基准；跨线程共享同一纪元，时间戳才可比较
    base: Instant,
    /// 上次放行时间戳（相对 base 的纳秒）
    last_emit_nanos: AtomicU64,
    /// 上次放行的百分比（-1 表示尚未放行过）
    last_pct: AtomicI64,
    /// 最小时间间隔（纳秒）
    interval_nanos: u64,
    /// 最小百分比步进
    min_pct_step: u8,
}

impl ProgressThrottle {
    pub fn new(min_pct_step: u8, min_interval: Duration) -> Self {
        Self {
            base: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            last_pct: AtomicI64::new(-1),
            interval_nanos: min_interval.as_nanos() as u64,
            min_pct_step,
        }
    }

    /// 是否放行本次进度回报
    ///
    /// 百分比前进满一个步进，或距上次放行超过最小间隔
    pub fn should_emit(&self, pct: u8) -> bool {
        let now = self.current_nanos();
        let last_time = self.last_emit_nanos.load(Ordering::Relaxed);
        let last_pct = self.last_pct.load(Ordering::Relaxed);

        let pct_ready = i64::from(pct) >= last_pct + i64::from(self.min_pct_step);
        let time_ready = now.saturating_sub(last_time) >= self.interval_nanos;

        if pct_ready || time_ready {
            self.last_emit_nanos.store(now, Ordering::Relaxed);
            self.last_pct.store(i64::from(pct), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// 强制放行（完成时的最后一次回报）
    pub fn force_emit(&self) {
        self.last_emit_nanos
            .store(self.current_nanos(), Ordering::Relaxed);
        self.last_pct.store(100, Ordering::Relaxed);
    }

    fn current_nanos(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }
}
