use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbaImage;
use placelog_common::config::PipelineConfig;
use placelog_common::frame::{self, CodecError};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::detector::{BoundsMismatch, ChangeDetector};
use crate::store::{FrameStore, PlaceRegistry, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("place {0} is blacklisted")]
    Blacklisted(i64),
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the asynchronous release path. These never reach the original
/// submitter; they are logged per place.
#[derive(Debug, thiserror::Error)]
enum ReleaseError {
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error(transparent)]
    Compare(#[from] BoundsMismatch),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct PendingSubmission {
    pixels: RgbaImage,
    fingerprint: String,
    received_at: DateTime<Utc>,
}

/// One open debounce window for a place. `epoch` identifies which release
/// task owns the window, so a stale task that wakes after its window was
/// replaced cannot release the successor early.
struct CooldownWindow {
    release_at: Instant,
    epoch: u64,
    pending: PendingSubmission,
}

/// Absorbs bursts of submissions per place, releasing at most one candidate
/// frame per place per cooldown interval into the change-detector path.
///
/// All window state lives in one mutex-guarded map with short critical
/// sections; the lock is never held across an await, and operations on
/// different places never block each other beyond those sections.
pub struct Coalescer {
    windows: Mutex<HashMap<i64, CooldownWindow>>,
    epochs: AtomicU64,
    cooldown: Duration,
    blacklist: HashSet<i64>,
    detector: ChangeDetector,
    store: Arc<dyn FrameStore>,
    registry: Arc<dyn PlaceRegistry>,
}

impl Coalescer {
    /// Must be created (and `submit` called) inside a tokio runtime; release
    /// tasks are spawned onto it.
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn FrameStore>,
        registry: Arc<dyn PlaceRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            windows: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            cooldown: Duration::from_secs(config.cooldown_secs),
            blacklist: config.blacklist.iter().copied().collect(),
            detector: ChangeDetector::new(config.dissimilarity_threshold),
            store,
            registry,
        })
    }

    /// Handle one inbound submission. Returns as soon as the payload is
    /// buffered; the caller never waits on the cooldown.
    ///
    /// Within an open window, later submissions overwrite earlier ones
    /// (last-write-wins) without rescheduling the release.
    pub fn submit(
        self: &Arc<Self>,
        place_id: i64,
        raw_bytes: &[u8],
        fingerprint: &str,
    ) -> Result<(), SubmitError> {
        if self.blacklist.contains(&place_id) {
            warn!(place_id, "submission for blacklisted place rejected");
            return Err(SubmitError::Blacklisted(place_id));
        }

        let pixels = frame::decode_image(raw_bytes)?;

        if !self.registry.exists(place_id)? {
            self.registry.register(place_id)?;
            debug!(place_id, "registered new place");
        }

        let pending = PendingSubmission {
            pixels,
            fingerprint: fingerprint.to_string(),
            received_at: Utc::now(),
        };

        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        if let Some(window) = windows.get_mut(&place_id) {
            if now < window.release_at {
                debug!(place_id, "overwrote pending payload in open window");
                window.pending = pending;
                return Ok(());
            }
        }

        // No window, or the existing one is already due: open a fresh one.
        let release_at = now + self.cooldown;
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let displaced = windows.insert(
            place_id,
            CooldownWindow {
                release_at,
                epoch,
                pending,
            },
        );
        if displaced.is_some() {
            // The old window was past due but its release task had not run
            // yet; its pending payload is dropped in favor of this one.
            warn!(place_id, "expired window displaced before release, dropping its payload");
        }
        debug!(
            place_id,
            cooldown_secs = self.cooldown.as_secs(),
            "opened new cooldown window"
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_release(place_id, epoch, release_at).await;
        });
        Ok(())
    }

    /// Sleeps until the window is due, then releases whatever payload is
    /// pending at wake time. A failure here is isolated to this place.
    async fn run_release(self: Arc<Self>, place_id: i64, epoch: u64, release_at: Instant) {
        tokio::time::sleep_until(release_at).await;

        let pending = {
            let mut windows = self.windows.lock().unwrap();
            // Only remove the window this task created; a newer window may
            // own the place by now.
            if windows.get(&place_id).is_some_and(|w| w.epoch == epoch) {
                windows.remove(&place_id).map(|w| w.pending)
            } else {
                None
            }
        };

        let Some(pending) = pending else {
            debug!(place_id, "cooldown window superseded before release");
            return;
        };

        match self.commit(place_id, pending) {
            Ok(Some(sequence_id)) => {
                debug!(place_id, sequence_id, "cooldown released, frame stored");
            }
            Ok(None) => {
                debug!(place_id, "cooldown released, frame rejected as duplicate");
            }
            Err(e) => {
                error!(place_id, error = %e, "cooldown release failed");
            }
        }
    }

    /// Run the released candidate through the change detector and append it
    /// on acceptance. `Ok(None)` means the frame was a duplicate no-op.
    fn commit(
        &self,
        place_id: i64,
        pending: PendingSubmission,
    ) -> Result<Option<i64>, ReleaseError> {
        let previous = match self.store.latest(place_id) {
            Ok(latest) => Some(latest.decode()?),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        if !self
            .detector
            .should_accept(&pending.pixels, previous.as_ref())?
        {
            return Ok(None);
        }

        let sequence_id = self.store.append(
            place_id,
            &pending.pixels,
            pending.received_at,
            &pending.fingerprint,
        )?;
        Ok(Some(sequence_id))
    }

    #[cfg(test)]
    fn open_window_count(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}
