//! Learning feedback loop
//!
//! One dispatcher task reads learning events from an unbounded queue and
//! forwards each to a lane task owned by its configuration key. Events for
//! one key are applied in submission order; lanes for different keys run
//! concurrently.
//!
//! A lane that sees nothing for its idle period closes itself. The next
//! event for that key opens a fresh lane, which first waits for the old one
//! to finish so ordering holds across the handover.

use crate::correction::Correction;
use crate::pattern::PatternId;
use crate::store::{PatternStore, StoreError};
use pkrguard_config::ConfigHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Human feedback attached to a recovery outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Whether the operator accepted the fix
    pub accepted: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// Something the store should learn from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LearningEvent {
    /// A reviewer corrected a finding
    Correction {
        pattern_id: PatternId,
        correction: Correction,
    },
    /// A recovery attempt finished
    RecoveryOutcome {
        template: String,
        success: bool,
        /// Patterns present before the fix and gone after it
        cleared_patterns: Vec<PatternId>,
        #[serde(default)]
        feedback: Option<Feedback>,
    },
}

/// How long a lane waits for another event before closing
pub const DEFAULT_LANE_IDLE: Duration = Duration::from_secs(30);

/// Totals reported by [`LearningLoop::drain`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LearningStats {
    pub applied: u64,
    pub failed: u64,
    /// Lanes opened over the loop's lifetime
    pub lanes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("learning loop is closed")]
    Closed,

    #[error("learning task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

type Envelope = (ConfigHash, LearningEvent);

/// Cloneable submission handle
#[derive(Debug, Clone)]
pub struct LearningHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LearningHandle {
    /// Queue an event under a configuration key
    ///
    /// # Errors
    /// [`LearningError::Closed`] once the loop has been drained.
    pub fn submit(&self, key: ConfigHash, event: LearningEvent) -> Result<(), LearningError> {
        self.tx.send((key, event)).map_err(|_| LearningError::Closed)
    }
}

/// The running feedback loop
#[derive(Debug)]
pub struct LearningLoop {
    handle: LearningHandle,
    store: Arc<PatternStore>,
    close: oneshot::Sender<()>,
    open_lanes: Arc<AtomicUsize>,
    dispatcher: JoinHandle<Result<LearningStats, LearningError>>,
}

impl LearningLoop {
    /// Start the dispatcher on the current runtime
    #[must_use]
    pub fn spawn(store: Arc<PatternStore>) -> Self {
        Self::spawn_with_idle(store, DEFAULT_LANE_IDLE)
    }

    /// Start the dispatcher with lanes closing after `idle` without events
    #[must_use]
    pub fn spawn_with_idle(store: Arc<PatternStore>, idle: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close, close_rx) = oneshot::channel();
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let open_lanes = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher {
            store: Arc::clone(&store),
            idle,
            lanes: HashMap::new(),
            open_lanes: Arc::clone(&open_lanes),
            retired_tx,
            generation: 0,
            stats: LearningStats::default(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(rx, retired_rx, close_rx));
        Self {
            handle: LearningHandle { tx },
            store,
            close,
            open_lanes,
            dispatcher,
        }
    }

    /// Submission handle for other components
    #[must_use]
    pub fn handle(&self) -> LearningHandle {
        self.handle.clone()
    }

    /// Lanes currently open
    #[must_use]
    pub fn open_lanes(&self) -> usize {
        self.open_lanes.load(Ordering::Relaxed)
    }

    /// Queue an event
    ///
    /// # Errors
    /// [`LearningError::Closed`] if the dispatcher has stopped.
    pub fn submit(&self, key: ConfigHash, event: LearningEvent) -> Result<(), LearningError> {
        self.handle.submit(key, event)
    }

    /// Stop accepting events, apply everything queued, and flush the store
    ///
    /// Cloned handles may still be alive; once the loop closes their
    /// submissions fail with [`LearningError::Closed`].
    ///
    /// # Errors
    /// A panicked lane or a failed flush.
    pub async fn drain(self) -> Result<LearningStats, LearningError> {
        let Self {
            handle,
            store,
            close,
            open_lanes: _,
            dispatcher,
        } = self;
        drop(handle);
        if close.send(()).is_err() {
            debug!("learning dispatcher already stopped");
        }
        let stats = dispatcher
            .await
            .map_err(|e| LearningError::Join(e.to_string()))??;
        store.flush()?;
        info!(applied = stats.applied, failed = stats.failed, lanes = stats.lanes, "learning loop drained");
        Ok(stats)
    }
}

type LaneResult = Result<(u64, u64), LearningError>;

struct Lane {
    generation: u64,
    tx: mpsc::UnboundedSender<LearningEvent>,
    task: JoinHandle<LaneResult>,
}

struct Dispatcher {
    store: Arc<PatternStore>,
    idle: Duration,
    lanes: HashMap<ConfigHash, Lane>,
    open_lanes: Arc<AtomicUsize>,
    retired_tx: mpsc::UnboundedSender<(ConfigHash, u64)>,
    generation: u64,
    stats: LearningStats,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        mut retired_rx: mpsc::UnboundedReceiver<(ConfigHash, u64)>,
        mut close: oneshot::Receiver<()>,
    ) -> Result<LearningStats, LearningError> {
        let mut closing = false;
        loop {
            tokio::select! {
                biased;
                Some((key, generation)) = retired_rx.recv() => self.retire(key, generation).await?,
                next = rx.recv() => match next {
                    Some((key, event)) => self.route(key, event),
                    None => break,
                },
                // Queued events are still delivered after close
                _ = &mut close, if !closing => {
                    closing = true;
                    rx.close();
                }
            }
        }
        self.finish().await
    }

    fn route(&mut self, key: ConfigHash, event: LearningEvent) {
        let event = match self.lanes.get(&key) {
            Some(lane) => match lane.tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let previous = self.lanes.remove(&key).map(|lane| lane.task);
        let lane = self.open_lane(key, previous);
        if lane.tx.send(event).is_err() {
            warn!(key = %key.short(), "learning lane closed early");
        }
        self.lanes.insert(key, lane);
        self.publish();
    }

    fn open_lane(&mut self, key: ConfigHash, previous: Option<JoinHandle<LaneResult>>) -> Lane {
        self.generation += 1;
        self.stats.lanes += 1;
        let generation = self.generation;
        debug!(key = %key.short(), generation, "opening learning lane");

        let (tx, mut rx) = mpsc::unbounded_channel::<LearningEvent>();
        let store = Arc::clone(&self.store);
        let retired = self.retired_tx.clone();
        let idle = self.idle;
        let task = tokio::spawn(async move {
            let (mut applied, mut failed) = match previous {
                Some(task) => task.await.map_err(|e| LearningError::Join(e.to_string()))??,
                None => (0, 0),
            };
            let mut idled = false;
            loop {
                let next = if idled {
                    rx.recv().await
                } else {
                    match tokio::time::timeout(idle, rx.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            idled = true;
                            rx.close();
                            continue;
                        }
                    }
                };
                let Some(event) = next else { break };
                match apply_event(&store, event) {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        warn!(key = %key.short(), error = %e, "learning event rejected");
                        failed += 1;
                    }
                }
            }
            if idled && retired.send((key, generation)).is_err() {
                debug!(key = %key.short(), "dispatcher gone before lane retired");
            }
            Ok((applied, failed))
        });
        Lane { generation, tx, task }
    }

    /// Collect an idle lane unless a newer one has replaced it
    async fn retire(&mut self, key: ConfigHash, generation: u64) -> Result<(), LearningError> {
        match self.lanes.remove(&key) {
            Some(lane) if lane.generation == generation => {
                debug!(key = %key.short(), generation, "learning lane retired");
                self.collect(lane).await?;
                self.publish();
            }
            Some(lane) => {
                self.lanes.insert(key, lane);
            }
            None => {}
        }
        Ok(())
    }

    async fn collect(&mut self, lane: Lane) -> Result<(), LearningError> {
        drop(lane.tx);
        let (applied, failed) = lane
            .task
            .await
            .map_err(|e| LearningError::Join(e.to_string()))??;
        self.stats.applied += applied;
        self.stats.failed += failed;
        Ok(())
    }

    async fn finish(mut self) -> Result<LearningStats, LearningError> {
        for (_, lane) in std::mem::take(&mut self.lanes) {
            self.collect(lane).await?;
        }
        self.publish();
        Ok(self.stats)
    }

    fn publish(&self) {
        self.open_lanes.store(self.lanes.len(), Ordering::Relaxed);
    }
}

/// Apply one event to the store
///
/// # Errors
/// Store errors from recording a correction or promoting a pattern.
pub fn apply_event(store: &PatternStore, event: LearningEvent) -> Result<(), StoreError> {
    match event {
        LearningEvent::Correction {
            pattern_id,
            correction,
        } => store.record_correction(&pattern_id, correction).map(|_| ()),
        LearningEvent::RecoveryOutcome {
            template,
            success,
            cleared_patterns,
            feedback,
        } => {
            let accepted = feedback.as_ref().map_or(true, |f| f.accepted);
            let effective = success && accepted;
            store.record_template_outcome(&template, effective);
            if effective {
                for id in &cleared_patterns {
                    match store.promote(id) {
                        Ok(confidence) => debug!(pattern = %id, confidence, "pattern promoted"),
                        Err(StoreError::UnknownPattern(_)) => {
                            debug!(pattern = %id, "cleared pattern no longer in store");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(())
        }
    }
}
