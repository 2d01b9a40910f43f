//! 指数退避重试
//!
//! 等待通过 `Clock` 完成，测试里可以换成不真正睡眠的实现。

use crate::error::StorageError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 可注入的等待源
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 定时器的时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次），至少为 1
    pub max_attempts: u32,
    /// 第一次重试前的等待时间
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// 第 `attempt` 次失败后的等待时间（从 0 计）：1s, 2s, 4s ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }

    /// 执行操作，可重试错误按指数退避重试
    ///
    /// 不可重试的错误（包括会话失效）立即返回。闭包参数是当前尝试序号。
    pub async fn run<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        label: &str,
        mut op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt + 1 >= max_attempts => {
                    error!("{} 最终失败 (共尝试 {} 次): {}", label, max_attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} 失败，{}ms 后重试 ({}/{}): {}",
                        label,
                        delay.as_millis(),
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
