//! Single serialized update queue.
//!
//! Background tasks never touch view state directly. They enqueue
//! [`EngineUpdate`]s and one hub task applies them in order, replacing each
//! published value as a whole. Readers hold `watch` receivers.

use crate::resolver::Resolution;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telemetry_core::{ArtifactKey, FailureKind, LocaleStatus, Notice, ProgressState};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub enum EngineUpdate {
    LocaleStatuses(Vec<LocaleStatus>),
    /// Progress of the run tracking session `session`.
    Progress { session: u64, state: ProgressState },
    Artifact { key: ArtifactKey, resolution: Resolution },
    /// Drop a published artifact that nothing displays any more.
    ForgetArtifact(ArtifactKey),
    Notice { kind: FailureKind, detail: Option<String> },
    DismissNotice(u64),
    /// Result of a background refresh started under polling generation
    /// `generation`; dropped once that generation is torn down.
    Refresh {
        generation: u64,
        update: Box<EngineUpdate>,
    },
}

/// Cloneable producer side of the queue.
#[derive(Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<EngineUpdate>,
    session: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
}

impl UpdateSender {
    /// Enqueue an update. Returns false once the hub is gone.
    pub async fn send(&self, update: EngineUpdate) -> bool {
        self.tx.send(update).await.is_ok()
    }

    pub async fn notice(&self, kind: FailureKind, detail: Option<String>) -> bool {
        self.send(EngineUpdate::Notice { kind, detail }).await
    }

    /// Start a new progress session; updates from older sessions are dropped.
    pub fn begin_session(&self) -> u64 {
        self.session.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Invalidate every refresh started so far.
    pub fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn hold_slot(&self) -> mpsc::OwnedPermit<EngineUpdate> {
        self.tx
            .clone()
            .reserve_owned()
            .await
            .expect("hub is running")
    }
}

/// Read side: the latest published value of each view.
#[derive(Clone)]
pub struct HubViews {
    pub locales: watch::Receiver<Arc<Vec<LocaleStatus>>>,
    pub progress: watch::Receiver<ProgressState>,
    pub artifacts: watch::Receiver<Arc<HashMap<ArtifactKey, Resolution>>>,
    pub notices: watch::Receiver<Arc<Vec<Notice>>>,
}

pub struct StateHub {
    sender: UpdateSender,
    views: HubViews,
    task: JoinHandle<()>,
}

impl StateHub {
    /// Spawn the hub task. Must be called inside a tokio runtime.
    pub fn spawn(queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let session = Arc::new(AtomicU64::new(0));
        let generation = Arc::new(AtomicU64::new(0));
        let (locales_tx, locales) = watch::channel(Arc::new(Vec::new()));
        let (progress_tx, progress) = watch::channel(ProgressState::default());
        let (artifacts_tx, artifacts) = watch::channel(Arc::new(HashMap::new()));
        let (notices_tx, notices) = watch::channel(Arc::new(Vec::new()));
        let state = HubState {
            session: Arc::clone(&session),
            generation: Arc::clone(&generation),
            locales: locales_tx,
            progress: progress_tx,
            artifacts: artifacts_tx,
            notices: notices_tx,
            next_notice: 1,
        };
        let task = tokio::spawn(state.run(rx));
        Self {
            sender: UpdateSender {
                tx,
                session,
                generation,
            },
            views: HubViews {
                locales,
                progress,
                artifacts,
                notices,
            },
            task,
        }
    }

    pub fn sender(&self) -> UpdateSender {
        self.sender.clone()
    }

    pub fn views(&self) -> HubViews {
        self.views.clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for StateHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct HubState {
    session: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    locales: watch::Sender<Arc<Vec<LocaleStatus>>>,
    progress: watch::Sender<ProgressState>,
    artifacts: watch::Sender<Arc<HashMap<ArtifactKey, Resolution>>>,
    notices: watch::Sender<Arc<Vec<Notice>>>,
    next_notice: u64,
}

impl HubState {
    async fn run(mut self, mut rx: mpsc::Receiver<EngineUpdate>) {
        while let Some(update) = rx.recv().await {
            self.apply(update);
        }
        debug!("update queue closed");
    }

    fn apply(&mut self, update: EngineUpdate) {
        match update {
            EngineUpdate::LocaleStatuses(statuses) => {
                self.locales.send_replace(Arc::new(statuses));
            }
            EngineUpdate::Progress { session, state } => {
                let current = self.session.load(Ordering::SeqCst);
                if session != current {
                    debug!(session, current, "dropping progress from a cancelled session");
                    return;
                }
                self.progress.send_replace(state);
            }
            EngineUpdate::Artifact { key, resolution } => {
                let mut next = HashMap::clone(&self.artifacts.borrow());
                next.insert(key, resolution);
                self.artifacts.send_replace(Arc::new(next));
            }
            EngineUpdate::ForgetArtifact(key) => {
                if !self.artifacts.borrow().contains_key(&key) {
                    return;
                }
                let mut next = HashMap::clone(&self.artifacts.borrow());
                next.remove(&key);
                self.artifacts.send_replace(Arc::new(next));
            }
            EngineUpdate::Notice { kind, detail } => {
                if let Some(detail) = &detail {
                    warn!(kind = ?kind, detail = %detail, "failure surfaced");
                }
                let mut next = Vec::clone(&self.notices.borrow());
                // One live banner per kind; a repeat refreshes it in place.
                next.retain(|n| n.kind != kind);
                next.push(Notice {
                    id: self.next_notice,
                    kind,
                    message: kind.user_message().to_string(),
                });
                self.next_notice += 1;
                self.notices.send_replace(Arc::new(next));
            }
            EngineUpdate::DismissNotice(id) => {
                let mut next = Vec::clone(&self.notices.borrow());
                let before = next.len();
                next.retain(|n| n.id != id);
                if next.len() != before {
                    self.notices.send_replace(Arc::new(next));
                }
            }
            EngineUpdate::Refresh { generation, update } => {
                let current = self.generation.load(Ordering::SeqCst);
                if generation != current {
                    debug!(generation, current, "dropping refresh from a torn-down generation");
                    return;
                }
                self.apply(*update);
            }
        }
    }
}
