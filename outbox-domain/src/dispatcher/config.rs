use std::time::Duration;

/// 调度器配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// 单次领取的最大记录数
    pub batch_size: usize,
    /// 领取并投递的周期
    pub tick_interval: Duration,
    /// 锁超时回收的周期
    pub reap_interval: Duration,
    /// publishing 状态超过该时长即视为持有者已崩溃
    pub stale_lock_threshold: Duration,
    /// 单条消息等待代理确认的上限
    pub confirm_timeout: Duration,
    pub purge_interval: Duration,
    /// 已发布记录的保留期
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            tick_interval: Duration::from_secs(10),
            reap_interval: Duration::from_secs(60),
            stale_lock_threshold: Duration::from_secs(300),
            confirm_timeout: Duration::from_secs(5),
            purge_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}
