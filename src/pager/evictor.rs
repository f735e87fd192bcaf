use anyhow::anyhow;
use indexmap::IndexSet;

/// Tracks pin counts and the release order of unpinned frames. The front of `lru` is the frame
/// released longest ago and is the next one to be reused.
pub(crate) struct Evictor {
    pin_count: Vec<usize>,
    lru: IndexSet<usize>,
}

impl Evictor {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            pin_count: vec![0; n],
            lru: (0..n).collect(),
        }
    }

    pub(crate) fn acquired(&mut self, frame_id: usize) {
        assert!(frame_id < self.pin_count.len());
        self.pin_count[frame_id] += 1;
        self.lru.shift_remove(&frame_id);
    }

    pub(crate) fn released(&mut self, frame_id: usize) {
        assert!(frame_id < self.pin_count.len());
        assert!(
            self.pin_count[frame_id] > 0,
            "releasing frame {frame_id} which is not pinned"
        );
        self.pin_count[frame_id] -= 1;
        if self.pin_count[frame_id] == 0 {
            self.lru.insert(frame_id);
        }
    }

    /// Takes the least recently released frame out of the LRU list. The caller is expected to
    /// pin it right away.
    pub(crate) fn evict(&mut self) -> anyhow::Result<usize> {
        self.lru
            .shift_remove_index(0)
            .ok_or_else(|| anyhow!("all frames are pinned"))
    }

    /// Marks an unpinned frame as holding nothing worth keeping, so it is reused first.
    pub(crate) fn invalidated(&mut self, frame_id: usize) {
        assert_eq!(
            0, self.pin_count[frame_id],
            "frame {frame_id} is still pinned"
        );
        if let Some(index) = self.lru.get_index_of(&frame_id) {
            self.lru.move_index(index, 0);
        }
    }

    pub(crate) fn pin_count(&self, frame_id: usize) -> usize {
        self.pin_count[frame_id]
    }
}
