use std::time::Duration;

/// 可以交给工作池执行的一次工作
///
/// `attempts` 是包含当前这次在内已经开始的尝试次数。
pub trait WorkUnit: Send + 'static {
    fn id(&self) -> &str;
    fn attempts(&self) -> u32;
    fn max_attempts(&self) -> u32;
    fn timeout(&self) -> Duration;

    fn has_attempts_left(&self) -> bool {
        self.attempts() < self.max_attempts()
    }
}
