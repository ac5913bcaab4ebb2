//! Per-key ordered log fan-out from one producer to many consumers.
//!
//! Each action run gets a channel holding the full history of the run plus a
//! `tokio::sync::broadcast` sender for live delivery. Subscribing snapshots
//! the history and attaches a receiver under the same lock that publishing
//! takes, so replay followed by live delivery has no gap and no duplicate.
//!
//! Live receivers are bounded by `subscriber_buffer`; a consumer that falls
//! further behind is disconnected with [`Lagged`] while the producer carries
//! on. Finishing a run drops the sender, so live subscribers drain and then
//! see end-of-stream. History stays available for replay during the drain
//! window and is purged after it.

use crate::action::{ActionKey, ActionToken};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogLine {
    #[schema(value_type = String)]
    pub action_key: ActionKey,
    #[schema(value_type = String, format = Uuid)]
    pub token: ActionToken,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// Where a new subscriber starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Full replay from sequence 0.
    Beginning,
    /// Only lines published after subscribing.
    Tail,
    /// Replay from the given sequence onwards.
    Sequence(u64),
}

impl FromStr for StartAt {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" | "beginning" => Ok(StartAt::Beginning),
            "tail" => Ok(StartAt::Tail),
            n => n
                .parse::<u64>()
                .map(|seq| {
                    if seq == 0 {
                        StartAt::Beginning
                    } else {
                        StartAt::Sequence(seq)
                    }
                })
                .map_err(|_| {
                    OrchestratorError::Validation(format!(
                        "log start must be 'start', 'tail' or a sequence number, got '{}'",
                        s
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Lines a live subscriber may fall behind before it is disconnected.
    pub subscriber_buffer: usize,
    /// How long a finished run's history stays available for replay.
    pub drain_window: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            drain_window: Duration::from_secs(60),
        }
    }
}

/// A subscriber fell too far behind and was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("log subscriber lagged behind by {skipped} lines")]
pub struct Lagged {
    pub skipped: u64,
}

struct Channel {
    token: ActionToken,
    lines: Vec<LogLine>,
    tx: Option<broadcast::Sender<LogLine>>,
    finished_at: Option<Instant>,
}

pub struct LogBroker {
    channels: Mutex<HashMap<ActionKey, Channel>>,
    config: BrokerConfig,
}

impl LogBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            config,
        }
    }

    // Publishing and subscribing never panic mid-update.
    fn lock(&self) -> MutexGuard<'_, HashMap<ActionKey, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock and drop channels whose drain window has passed. Publishing skips this.
    fn lock_purged(&self) -> MutexGuard<'_, HashMap<ActionKey, Channel>> {
        let mut channels = self.lock();
        let drain = self.config.drain_window;
        channels.retain(|key, channel| {
            let keep = channel
                .finished_at
                .map_or(true, |finished| finished.elapsed() < drain);
            if !keep {
                debug!(key = %key, token = %channel.token, "log channel drained");
            }
            keep
        });
        channels
    }

    /// Start a fresh channel for the run `token` on `key`.
    pub fn open(&self, key: &ActionKey, token: ActionToken) {
        let (tx, _) = broadcast::channel(self.config.subscriber_buffer.max(1));
        let previous = self.lock_purged().insert(
            key.clone(),
            Channel {
                token,
                lines: Vec::new(),
                tx: Some(tx),
                finished_at: None,
            },
        );
        if let Some(previous) = previous {
            debug!(key = %key, replaced = %previous.token, "log channel replaced by new run");
        }
    }

    /// Append a line to the run's log. Never waits on subscribers.
    ///
    /// Returns None when the run is not the current one for the key or has
    /// already finished.
    pub fn publish(&self, key: &ActionKey, token: ActionToken, text: impl Into<String>) -> Option<LogLine> {
        let mut channels = self.lock();
        let channel = channels.get_mut(key).filter(|c| c.token == token)?;
        let tx = channel.tx.as_ref()?;

        let line = LogLine {
            action_key: key.clone(),
            token,
            sequence: channel.lines.len() as u64,
            timestamp: Utc::now(),
            text: text.into(),
        };
        // No live subscribers is fine; the line is kept for replay.
        let _ = tx.send(line.clone());
        channel.lines.push(line.clone());

        Some(line)
    }

    /// Close the live stream of run `token`; history remains for the drain window.
    pub fn finish(&self, key: &ActionKey, token: ActionToken) {
        let mut channels = self.lock_purged();
        if let Some(channel) = channels.get_mut(key).filter(|c| c.token == token) {
            channel.tx = None;
            channel.finished_at = Some(Instant::now());
            debug!(key = %key, %token, lines = channel.lines.len(), "log channel finished");
        }
    }

    pub fn subscribe(&self, key: &ActionKey, start: StartAt) -> Result<LogSubscription> {
        let channels = self.lock_purged();
        let channel = channels
            .get(key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("log stream for {}", key)))?;

        let backlog = match start {
            StartAt::Beginning => channel.lines.iter().cloned().collect(),
            StartAt::Tail => VecDeque::new(),
            StartAt::Sequence(from) => channel
                .lines
                .iter()
                .skip(from as usize)
                .cloned()
                .collect(),
        };

        Ok(LogSubscription {
            token: channel.token,
            backlog,
            rx: channel.tx.as_ref().map(|tx| tx.subscribe()),
        })
    }

    /// Lines of the current run from `from` onwards, without subscribing.
    pub fn snapshot(&self, key: &ActionKey, from: u64) -> Result<Vec<LogLine>> {
        let channels = self.lock_purged();
        let channel = channels
            .get(key)
            .ok_or_else(|| OrchestratorError::NotFound(format!("log stream for {}", key)))?;

        Ok(channel.lines.iter().skip(from as usize).cloned().collect())
    }

    /// A publishing handle bound to one run.
    pub fn sink(self: &Arc<Self>, key: ActionKey, token: ActionToken) -> LogSink {
        LogSink {
            broker: self.clone(),
            key,
            token,
        }
    }
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Producer handle given to the infrastructure tool.
#[derive(Clone)]
pub struct LogSink {
    broker: Arc<LogBroker>,
    key: ActionKey,
    token: ActionToken,
}

impl LogSink {
    pub fn line(&self, text: impl Into<String>) {
        if self.broker.publish(&self.key, self.token, text).is_none() {
            warn!(key = %self.key, token = %self.token, "log line dropped, run no longer current");
        }
    }

    pub fn key(&self) -> &ActionKey {
        &self.key
    }
}

pub struct LogSubscription {
    token: ActionToken,
    backlog: VecDeque<LogLine>,
    rx: Option<broadcast::Receiver<LogLine>>,
}

impl LogSubscription {
    /// The run this subscription follows.
    pub fn token(&self) -> ActionToken {
        self.token
    }

    /// Next line in sequence order, `Ok(None)` at end of stream.
    ///
    /// After `Err(Lagged)` the subscription is closed; reconnect with a replay.
    pub async fn recv(&mut self) -> std::result::Result<Option<LogLine>, Lagged> {
        if let Some(line) = self.backlog.pop_front() {
            return Ok(Some(line));
        }

        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };

        match rx.recv().await {
            Ok(line) => Ok(Some(line)),
            Err(RecvError::Closed) => {
                self.rx = None;
                Ok(None)
            }
            Err(RecvError::Lagged(skipped)) => {
                self.rx = None;
                Err(Lagged { skipped })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ActionKey {
        ActionKey::for_workspace("gina", "ws")
    }

    async fn drain(sub: &mut LogSubscription) -> Vec<LogLine> {
        let mut lines = Vec::new();
        while let Some(line) = sub.recv().await.expect("no lag") {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn sequences_start_at_zero_and_increase() {
        let broker = LogBroker::default();
        let token = ActionToken::new();
        broker.open(&key(), token);

        for i in 0..5 {
            let line = broker.publish(&key(), token, format!("line {}", i)).unwrap();
            assert_eq!(line.sequence, i);
        }
    }

    #[tokio::test]
    async fn replay_matches_continuous_subscriber() {
        let broker = LogBroker::default();
        let token = ActionToken::new();
        broker.open(&key(), token);

        broker.publish(&key(), token, "a");
        let mut live = broker.subscribe(&key(), StartAt::Beginning).unwrap();
        broker.publish(&key(), token, "b");
        let mut tail = broker.subscribe(&key(), StartAt::Tail).unwrap();
        broker.publish(&key(), token, "c");
        broker.finish(&key(), token);

        let continuous = drain(&mut live).await;
        let mut replay = broker.subscribe(&key(), StartAt::Beginning).unwrap();
        let replayed = drain(&mut replay).await;

        assert_eq!(
            continuous.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(continuous, replayed);

        let tailed = drain(&mut tail).await;
        assert_eq!(tailed.len(), 1);
        assert_eq!(tailed[0].sequence, 2);
    }

    #[tokio::test]
    async fn replay_from_sequence_skips_earlier_lines() {
        let broker = LogBroker::default();
        let token = ActionToken::new();
        broker.open(&key(), token);
        for text in ["a", "b", "c"] {
            broker.publish(&key(), token, text);
        }
        broker.finish(&key(), token);

        let mut sub = broker.subscribe(&key(), StartAt::Sequence(1)).unwrap();
        let lines = drain(&mut sub).await;
        assert_eq!(lines.first().map(|l| l.sequence), Some(1));
        assert_eq!(lines.len(), 2);
        assert_eq!(broker.snapshot(&key(), 2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected_without_blocking_producer() {
        let broker = LogBroker::new(BrokerConfig {
            subscriber_buffer: 4,
            drain_window: Duration::from_secs(60),
        });
        let token = ActionToken::new();
        broker.open(&key(), token);
        let mut slow = broker.subscribe(&key(), StartAt::Tail).unwrap();

        for i in 0..20 {
            assert!(broker.publish(&key(), token, format!("{}", i)).is_some());
        }

        let result = slow.recv().await;
        assert!(matches!(result, Err(Lagged { skipped }) if skipped > 0));
        // Disconnected for good
        assert_eq!(slow.recv().await, Ok(None));

        // A reconnecting subscriber still gets the full history
        let mut replay = broker.subscribe(&key(), StartAt::Beginning).unwrap();
        broker.finish(&key(), token);
        assert_eq!(drain(&mut replay).await.len(), 20);
    }

    #[tokio::test]
    async fn stale_run_cannot_publish_into_new_run() {
        let broker = LogBroker::default();
        let old = ActionToken::new();
        let new = ActionToken::new();
        broker.open(&key(), old);
        broker.publish(&key(), old, "old");
        broker.open(&key(), new);

        assert!(broker.publish(&key(), old, "late").is_none());
        let line = broker.publish(&key(), new, "fresh").unwrap();
        assert_eq!(line.sequence, 0);
        assert_eq!(broker.subscribe(&key(), StartAt::Beginning).unwrap().token(), new);
    }

    #[tokio::test]
    async fn finished_channel_rejects_lines_and_drains_away() {
        let broker = LogBroker::new(BrokerConfig {
            subscriber_buffer: 16,
            drain_window: Duration::from_millis(50),
        });
        let token = ActionToken::new();
        broker.open(&key(), token);
        broker.publish(&key(), token, "done");
        broker.finish(&key(), token);

        assert!(broker.publish(&key(), token, "after").is_none());
        assert_eq!(broker.snapshot(&key(), 0).unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            broker.subscribe(&key(), StartAt::Beginning),
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn publishing_leaves_drained_channels_to_the_next_lookup() {
        let broker = LogBroker::new(BrokerConfig {
            subscriber_buffer: 16,
            drain_window: Duration::from_millis(20),
        });
        let other = ActionKey::for_workspace("gina", "other");
        let (old, live) = (ActionToken::new(), ActionToken::new());
        broker.open(&other, old);
        broker.finish(&other, old);
        broker.open(&key(), live);

        tokio::time::sleep(Duration::from_millis(40)).await;
        broker.publish(&key(), live, "hot path");
        assert_eq!(broker.lock().len(), 2);

        assert_eq!(broker.snapshot(&key(), 0).unwrap().len(), 1);
        assert!(!broker.lock().contains_key(&other));
    }

    #[test]
    fn start_at_parses_query_values() {
        assert_eq!("start".parse::<StartAt>().unwrap(), StartAt::Beginning);
        assert_eq!("0".parse::<StartAt>().unwrap(), StartAt::Beginning);
        assert_eq!("tail".parse::<StartAt>().unwrap(), StartAt::Tail);
        assert_eq!("7".parse::<StartAt>().unwrap(), StartAt::Sequence(7));
        assert!("soon".parse::<StartAt>().is_err());
    }
}
