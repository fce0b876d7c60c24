use std::collections::{HashMap, VecDeque};
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// Per-frame access record. A frame with fewer than `k` recorded accesses is
/// in the *history* partition; once it reaches `k` accesses it moves to the
/// *cache* partition. Only the `k` most recent timestamps are retained, so
/// `history.front()` is the first access for history frames and the
/// kth-most-recent access for cache frames.
struct FrameRecord {
    history: VecDeque<u64>,
    evictable: bool,
}

struct ReplacerState {
    records: HashMap<FrameId, FrameRecord>,
    current_timestamp: u64,
    evictable_count: usize,
}

/// LRU-K page replacement policy.
///
/// Evicts the evictable frame whose backward k-distance (current time minus
/// the kth-most-recent access) is largest. Frames with fewer than `k`
/// accesses have infinite backward k-distance and are preferred, FIFO by
/// first access.
pub struct LruKReplacer {
    capacity: usize,
    k: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            capacity: num_frames,
            k,
            state: Mutex::new(ReplacerState {
                records: HashMap::with_capacity(num_frames),
                current_timestamp: 0,
                evictable_count: 0,
            }),
        }
    }

    /// Record an access to the given frame at the current timestamp. Starts
    /// tracking the frame (non-evictable) if it was untracked.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            (frame_id as usize) < self.capacity,
            "frame id {} out of range for replacer of {} frames",
            frame_id,
            self.capacity
        );

        let mut state = self.state.lock();
        let now = state.current_timestamp;
        state.current_timestamp += 1;

        let k = self.k;
        let record = state.records.entry(frame_id).or_insert_with(|| FrameRecord {
            history: VecDeque::with_capacity(k),
            evictable: false,
        });
        record.history.push_back(now);
        if record.history.len() > k {
            record.history.pop_front();
        }
    }

    /// Flip a frame's evictable flag. Untracked frames are ignored.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!(
            (frame_id as usize) < self.capacity,
            "frame id {} out of range for replacer of {} frames",
            frame_id,
            self.capacity
        );

        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&frame_id) else {
            return;
        };
        if record.evictable != evictable {
            record.evictable = evictable;
            if evictable {
                state.evictable_count += 1;
            } else {
                state.evictable_count -= 1;
            }
        }
    }

    /// Choose and remove a victim frame, or `None` if nothing is evictable.
    ///
    /// History frames (fewer than k accesses) win over cache frames; ties
    /// within a partition go to the smallest retained front timestamp, which
    /// is the oldest first access for history frames and the oldest
    /// kth-most-recent access for cache frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock();
        if state.evictable_count == 0 {
            return None;
        }

        let mut victim: Option<(FrameId, bool, u64)> = None;
        for (&frame_id, record) in state.records.iter() {
            if !record.evictable {
                continue;
            }
            let in_history = record.history.len() < self.k;
            let front = *record.history.front().unwrap();
            let better = match victim {
                None => true,
                Some((_, v_in_history, v_front)) => {
                    if in_history != v_in_history {
                        in_history
                    } else {
                        front < v_front
                    }
                }
            };
            if better {
                victim = Some((frame_id, in_history, front));
            }
        }

        let (frame_id, _, _) = victim?;
        state.records.remove(&frame_id);
        state.evictable_count -= 1;
        Some(frame_id)
    }

    /// Stop tracking a frame entirely. Panics if the frame is tracked but not
    /// evictable; removing a pinned frame is a caller bug. Untracked frames
    /// are a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get(&frame_id) else {
            return;
        };
        assert!(
            record.evictable,
            "attempted to remove non-evictable frame {} from replacer",
            frame_id
        );
        state.records.remove(&frame_id);
        state.evictable_count -= 1;
    }

    /// Number of frames currently eligible for eviction.
    pub fn evictable_count(&self) -> usize {
        self.state.lock().evictable_count
    }
}
