//! Cooperative cancellation for host tasks

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a future did not run to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The per-call limit elapsed
    TimedOut,
    /// The shared token fired
    Cancelled,
}

/// Run `fut` to completion unless `limit` elapses or `token` fires first.
///
/// The future is dropped before this returns, so anything it borrowed is
/// available again to the caller.
pub async fn run_until<F>(
    fut: F,
    limit: Option<Duration>,
    token: &CancellationToken,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    let sleep = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Interrupted::Cancelled),
        _ = sleep => Err(Interrupted::TimedOut),
        output = fut => Ok(output),
    }
}

/// Child token of `parent` that also fires once `deadline` has passed
pub fn deadline_token(parent: &CancellationToken, deadline: Option<Duration>) -> CancellationToken {
    let token = parent.child_token();
    if let Some(deadline) = deadline {
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(deadline) => timer.cancel(),
            }
        });
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_first() {
        let token = CancellationToken::new();
        let out = run_until(async { 7 }, Some(Duration::from_secs(1)), &token).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_elapses() {
        let token = CancellationToken::new();
        let out = run_until(
            std::future::pending::<()>(),
            Some(Duration::from_millis(200)),
            &token,
        )
        .await;
        assert_eq!(out, Err(Interrupted::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_token_fires() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, Some(Duration::from_millis(50)));
        let out = run_until(std::future::pending::<()>(), None, &token).await;
        assert_eq!(out, Err(Interrupted::Cancelled));
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let token = deadline_token(&parent, None);
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
