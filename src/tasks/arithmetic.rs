//! Arithmetic demo tasks.

use crate::config::RetryPolicy;
use crate::task::{DockhandTask, TaskContext, TaskError, TaskErrorKind, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

fn division_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(3).retry_on([TaskErrorKind::DivisionByZero])
}

/// `add(num1, num2)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Add {
    /// Left operand
    pub num1: i64,
    /// Right operand
    pub num2: i64,
}

#[async_trait]
impl DockhandTask for Add {
    const NAME: &'static str = "add";
    type Output = i64;

    async fn run(self, ctx: &TaskContext) -> TaskResult<i64> {
        tracing::debug!(task_id = %ctx.task_id, num1 = self.num1, num2 = self.num2, "Adding");
        self.num1
            .checked_add(self.num2)
            .ok_or_else(|| TaskError::invalid_arguments("addition overflows"))
    }

    fn retry_policy() -> Option<RetryPolicy> {
        Some(division_retry_policy())
    }
}

/// `retry_demo(num)`: returns `num / num`, so `0` fails with a retryable
/// division by zero until retries run out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDemo {
    /// Divided by itself
    pub num: i64,
}

#[async_trait]
impl DockhandTask for RetryDemo {
    const NAME: &'static str = "retry_demo";
    type Output = f64;

    async fn run(self, ctx: &TaskContext) -> TaskResult<f64> {
        if self.num == 0 {
            tracing::info!(task_id = %ctx.task_id, attempt = ctx.attempt, "Dividing by zero");
            return Err(TaskError::division_by_zero());
        }
        Ok(self.num as f64 / self.num as f64)
    }

    fn retry_policy() -> Option<RetryPolicy> {
        Some(division_retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::tests::ctx;

    #[tokio::test]
    async fn test_add() {
        let sum = Add { num1: 2, num2: 40 }.run(&ctx()).await.unwrap();
        assert_eq!(sum, 42);

        let overflow = Add { num1: i64::MAX, num2: 1 }.run(&ctx()).await.unwrap_err();
        assert_eq!(overflow.kind, TaskErrorKind::InvalidArguments);
    }

    #[tokio::test]
    async fn test_retry_demo() {
        assert_eq!(RetryDemo { num: 7 }.run(&ctx()).await.unwrap(), 1.0);

        let err = RetryDemo { num: 0 }.run(&ctx()).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::DivisionByZero);

        let policy = RetryDemo::retry_policy().unwrap();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 600_000);
        assert!(policy.enable_jitter);
        assert!(policy.should_retry(TaskErrorKind::DivisionByZero, 2));
        assert!(!policy.should_retry(TaskErrorKind::DivisionByZero, 3));
        assert!(!policy.should_retry(TaskErrorKind::InvalidArguments, 0));
    }
}
