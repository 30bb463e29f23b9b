//! 重试策略（OutboxPolicy）
//!
//! 存储侧共享的重试参数：指数退避与最大尝试次数。
//!
use std::time::Duration;

/// 指数退避：`delay(n) = min(cap, base × 2^n)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// 第 `attempts` 次失败后的等待时长，溢出时取上限
    pub fn delay(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutboxPolicy {
    /// 达到该次数后记录不再被领取
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::default(),
        }
    }
}
