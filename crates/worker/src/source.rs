use std::time::Duration;

use async_trait::async_trait;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::WorkUnit;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// 工作池的工作来源
///
/// 工作池只负责槽位、超时和重试判定，取工作以及结果落地都交给实现方。
#[async_trait]
pub trait WorkSource: Send + Sync + 'static {
    type Unit: WorkUnit;

    /// 取下一个工作单元
    ///
    /// 暂时没有可执行的单元时返回 `Ok(None)`，`cancel` 触发时应尽快返回。
    async fn fetch(&self, cancel: &CancellationToken) -> ClusterResult<Option<Self::Unit>>;

    /// 构造一次执行，返回的 future 会在独立任务中运行
    ///
    /// `cancel` 在超时或强制停机时触发。
    fn execute(
        &self,
        unit: &Self::Unit,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ClusterResult<()>>;

    /// 执行成功
    async fn complete(&self, unit: Self::Unit) -> ClusterResult<()>;

    /// 第 `retry_count` 次重试前的等待时间
    fn retry_delay(&self, unit: &Self::Unit, retry_count: u32) -> Duration;

    /// 失败但仍有尝试次数，在 `delay` 后重新执行
    async fn retry(&self, unit: Self::Unit, delay: Duration, cause: &ClusterError)
        -> ClusterResult<()>;

    /// 尝试次数耗尽，`error` 为 [`ClusterError::JobExhausted`]
    async fn fail(&self, unit: Self::Unit, error: ClusterError, cause: ClusterError)
        -> ClusterResult<()>;

    /// 停机时被强制中断的单元
    async fn abandon(&self, _unit: Self::Unit) -> ClusterResult<()> {
        Ok(())
    }
}
