use std::any::Any;
use std::time::Duration;

use cluster_core::{ClusterError, ClusterResult};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 单次执行的结果
#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed,
    Failed(ClusterError),
    /// 停机期限已到，执行被强制中断
    Abandoned,
}

/// 在独立任务中执行处理函数
///
/// panic 被转换为 [`ClusterError::HandlerPanic`]；超时或 `shutdown` 触发时
/// 先取消 `run_cancel` 再中止任务。`timeout` 为零表示不限时。
pub async fn execute_guarded(
    execution: BoxFuture<'static, ClusterResult<()>>,
    timeout: Duration,
    run_cancel: CancellationToken,
    shutdown: &CancellationToken,
) -> ExecutionOutcome {
    let mut handle = tokio::spawn(execution);

    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(timeout).await
        }
    };

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(())) => ExecutionOutcome::Completed,
            Ok(Err(e)) => ExecutionOutcome::Failed(e),
            Err(join_error) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!("处理函数panic: {}", message);
                ExecutionOutcome::Failed(ClusterError::HandlerPanic(message))
            }
            Err(_) => ExecutionOutcome::Failed(ClusterError::Cancelled),
        },
        _ = deadline => {
            run_cancel.cancel();
            handle.abort();
            ExecutionOutcome::Failed(ClusterError::Timeout(format!(
                "执行超过 {timeout:?}"
            )))
        }
        _ = shutdown.cancelled() => {
            run_cancel.cancel();
            handle.abort();
            ExecutionOutcome::Abandoned
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
