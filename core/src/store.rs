use chrono::{DateTime, Utc};
use image::RgbaImage;
use placelog_common::frame::{self, CodecError, Frame};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced frame or place does not exist. Kept distinct from
    /// backend failures so callers can map it to a missing-resource response.
    #[error("frame not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Append-only persistence of accepted frames.
///
/// Implementations assign monotonically increasing sequence ids and never
/// mutate a stored frame. Callers are expected to run the change detector
/// before appending; the store itself does not compare frames.
pub trait FrameStore: Send + Sync {
    /// Persist an accepted frame, returning its sequence id.
    fn append(
        &self,
        place_id: i64,
        pixels: &RgbaImage,
        captured_at: DateTime<Utc>,
        submitter: &str,
    ) -> Result<i64, StoreError>;

    /// Most recently appended frame for a place.
    fn latest(&self, place_id: i64) -> Result<Frame, StoreError>;

    fn by_id(&self, sequence_id: i64) -> Result<Frame, StoreError>;

    /// Frames for a place with sequence ids in the inclusive range, in the
    /// requested order. Bounds may be given in either orientation.
    fn range(
        &self,
        place_id: i64,
        from_id: i64,
        to_id: i64,
        order: Order,
    ) -> Result<Vec<Frame>, StoreError>;
}

/// Registry of known places. Places are created implicitly on first sight
/// and never deleted.
pub trait PlaceRegistry: Send + Sync {
    fn exists(&self, place_id: i64) -> Result<bool, StoreError>;
    fn register(&self, place_id: i64) -> Result<(), StoreError>;
}

/// In-process store backing the pipeline in tests and embedded setups.
#[derive(Default)]
pub struct MemoryFrameStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    frames: Vec<Frame>,
    places: HashSet<i64>,
    next_id: i64,
}

impl MemoryFrameStore {
    pub fn frame_count(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }
}

impl FrameStore for MemoryFrameStore {
    fn append(
        &self,
        place_id: i64,
        pixels: &RgbaImage,
        captured_at: DateTime<Utc>,
        submitter: &str,
    ) -> Result<i64, StoreError> {
        let data = frame::encode_png(pixels)?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let sequence_id = inner.next_id;
        inner.frames.push(Frame {
            sequence_id,
            place_id,
            captured_at,
            submitter: submitter.to_string(),
            data,
        });
        Ok(sequence_id)
    }

    fn latest(&self, place_id: i64) -> Result<Frame, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .frames
            .iter()
            .rev()
            .find(|f| f.place_id == place_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn by_id(&self, sequence_id: i64) -> Result<Frame, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .frames
            .iter()
            .find(|f| f.sequence_id == sequence_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn range(
        &self,
        place_id: i64,
        from_id: i64,
        to_id: i64,
        order: Order,
    ) -> Result<Vec<Frame>, StoreError> {
        let (lo, hi) = (from_id.min(to_id), from_id.max(to_id));
        let inner = self.inner.lock().unwrap();
        let mut frames: Vec<Frame> = inner
            .frames
            .iter()
            .filter(|f| f.place_id == place_id && f.sequence_id >= lo && f.sequence_id <= hi)
            .cloned()
            .collect();
        frames.sort_by_key(|f| f.sequence_id);
        if order == Order::Descending {
            frames.reverse();
        }
        Ok(frames)
    }
}

impl PlaceRegistry for MemoryFrameStore {
    fn exists(&self, place_id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().places.contains(&place_id))
    }

    fn register(&self, place_id: i64) -> Result<(), StoreError> {
        self.inner.lock().unwrap().places.insert(place_id);
        Ok(())
    }
}
