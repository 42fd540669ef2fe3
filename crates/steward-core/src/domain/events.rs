//! Events - elector が観測したリーダーシップの変化
//!
//! コールバックではなくチャネルで配信する。呼び出し側は購読し、テストは
//! 受け取った順序を検証する。

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// LeaderContext は 1 term 分の実行コンテキスト
///
/// リーダーでなくなると cancel される（renew deadline 超過、または elector 自体の cancel）。
#[derive(Clone)]
pub struct LeaderContext {
    identity: String,
    term: u64,
    token: CancellationToken,
}

impl LeaderContext {
    pub(crate) fn new(identity: String, term: u64, token: CancellationToken) -> Self {
        Self {
            identity,
            term,
            token,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 1 for the first term this process leads, 2 for the next, ...
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl fmt::Debug for LeaderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderContext")
            .field("identity", &self.identity)
            .field("term", &self.term)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// LeadershipEvent は elector が発行するイベント
///
/// `Acquired` と `Lost` は `Acquired` から始まって必ず交互に届く。
/// `NewLeader` はいつでも届きうる。自分がリースを取ったときは対応する
/// `Acquired` の直前に届く。
#[derive(Debug, Clone)]
pub enum LeadershipEvent {
    /// This process became leader.
    Acquired(LeaderContext),

    /// This process stopped leading.
    Lost,

    /// A holder different from the previously observed one was seen,
    /// including the first holder ever observed.
    NewLeader(String),
}

impl LeadershipEvent {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeadershipEvent::Acquired(_))
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, LeadershipEvent::Lost)
    }

    pub fn new_leader(&self) -> Option<&str> {
        match self {
            LeadershipEvent::NewLeader(identity) => Some(identity),
            _ => None,
        }
    }
}

/// LeadershipEvents は elector のイベントストリームの受信側
///
/// elector の run loop が返るか、一度も run していない elector が drop されると終わる。
pub struct LeadershipEvents {
    rx: mpsc::UnboundedReceiver<LeadershipEvent>,
}

impl LeadershipEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LeadershipEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<LeadershipEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<LeadershipEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything buffered so far.
    pub fn drain(&mut self) -> Vec<LeadershipEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
