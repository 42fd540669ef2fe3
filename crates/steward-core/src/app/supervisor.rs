//! Supervisor - リーダーの間だけ処理を走らせる
//!
//! [`LeadershipEvents`] を消費する。`Acquired` のたびに term context を渡して
//! 呼び出し側の future を spawn し、`Lost` ではそのタスクの終了を待ってから
//! 次に進む。term が重なることはない。

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::domain::{LeaderContext, LeadershipEvent, LeadershipEvents};

/// Drive `on_started` from leadership events until the stream ends.
///
/// The future returned by `on_started` should finish once the context is
/// cancelled; the supervisor waits for it on every loss of leadership.
pub async fn supervise<F, Fut>(mut events: LeadershipEvents, mut on_started: F)
where
    F: FnMut(LeaderContext) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut current: Option<JoinHandle<()>> = None;

    while let Some(event) = events.recv().await {
        match event {
            LeadershipEvent::Acquired(ctx) => {
                if let Some(previous) = current.take() {
                    finish(previous).await;
                }
                info!(identity = %ctx.identity(), term = ctx.term(), "started leading");
                current = Some(tokio::spawn(on_started(ctx)));
            }
            LeadershipEvent::Lost => {
                info!("stopped leading");
                if let Some(previous) = current.take() {
                    finish(previous).await;
                }
            }
            LeadershipEvent::NewLeader(identity) => {
                info!(leader = %identity, "new leader elected");
            }
        }
    }

    if let Some(previous) = current.take() {
        finish(previous).await;
    }
}

async fn finish(task: JoinHandle<()>) {
    if let Err(err) = task.await {
        error!(error = %err, "leader task failed");
    }
}
