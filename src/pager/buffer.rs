use crate::id::{PageId, TableId};
use crate::pager::evictor::Evictor;
use crate::pager::file_manager::FileManager;
use crate::pager::{Node, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct FrameKey {
    table: TableId,
    pgid: PageId,
}

struct Frame {
    key: Option<FrameKey>,
    dirty: bool,
    buffer: Box<[u8]>,
}

/// Fixed set of page-sized frames shared by every open table.
///
/// Locks are always taken in the order `internal`, `evictor`, frame, `files`.
pub(crate) struct BufferPool {
    frames: Box<[Mutex<Frame>]>,
    internal: Mutex<PoolInternal>,
    evictor: Mutex<Evictor>,
    files: Mutex<FileManager>,
}

struct PoolInternal {
    page_to_frame: HashMap<FrameKey, usize>,
}

impl BufferPool {
    pub(crate) fn new(n: usize) -> Self {
        let frames = (0..n)
            .map(|_| {
                Mutex::new(Frame {
                    key: None,
                    dirty: false,
                    buffer: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            frames,
            internal: Mutex::new(PoolInternal {
                page_to_frame: HashMap::with_capacity(n),
            }),
            evictor: Mutex::new(Evictor::new(n)),
            files: Mutex::new(FileManager::new()),
        }
    }

    pub(crate) fn register_file(&self, table: TableId, file: File) {
        self.files.lock().register(table, file);
    }

    /// Detaches the table file. The table must not have any frame left in the pool.
    pub(crate) fn unregister_file(&self, table: TableId) -> Option<File> {
        let internal = self.internal.lock();
        assert!(
            internal.page_to_frame.keys().all(|key| key.table != table),
            "table {table:?} still has pages in the buffer pool"
        );
        self.files.lock().unregister(table)
    }

    /// Pins the page into a frame, loading it from disk when it is not resident. Pages beyond
    /// the end of the file read as zeroes.
    pub(crate) fn pin(&self, table: TableId, pgid: PageId) -> anyhow::Result<PageGuard<'_>> {
        log::trace!("pin {table:?} {pgid:?}");
        let key = FrameKey { table, pgid };

        let mut internal = self.internal.lock();
        let mut evictor = self.evictor.lock();
        if let Some(frame_id) = internal.page_to_frame.get(&key).copied() {
            evictor.acquired(frame_id);
            return Ok(PageGuard {
                pool: self,
                frame_id,
                key,
            });
        }

        let frame_id = evictor.evict()?;
        evictor.acquired(frame_id);
        drop(evictor);

        let mut frame = self.frames[frame_id].lock();
        let result = self.fetch(&mut internal, &mut frame, key);
        drop(frame);
        if let Err(err) = result {
            self.evictor.lock().released(frame_id);
            return Err(err);
        }

        internal.page_to_frame.insert(key, frame_id);
        Ok(PageGuard {
            pool: self,
            frame_id,
            key,
        })
    }

    fn fetch(
        &self,
        internal: &mut PoolInternal,
        frame: &mut Frame,
        key: FrameKey,
    ) -> anyhow::Result<()> {
        let mut files = self.files.lock();
        if let Some(old) = frame.key {
            if frame.dirty {
                log::trace!("write back {:?} {:?}", old.table, old.pgid);
                files.write_page(old.table, old.pgid, &frame.buffer)?;
                frame.dirty = false;
            }
            internal.page_to_frame.remove(&old);
            frame.key = None;
        }

        if !files.read_page(key.table, key.pgid, &mut frame.buffer)? {
            frame.buffer.fill(0);
        }
        frame.key = Some(key);
        Ok(())
    }

    fn release(&self, frame_id: usize) {
        log::trace!("release frame_id={frame_id}");
        self.evictor.lock().released(frame_id);
    }

    /// Writes every dirty page of the table to its file and syncs it.
    pub(crate) fn flush_table(&self, table: TableId) -> anyhow::Result<()> {
        let _internal = self.internal.lock();
        for frame in self.frames.iter() {
            let mut frame = frame.lock();
            let Some(key) = frame.key else {
                continue;
            };
            if key.table == table && frame.dirty {
                self.files
                    .lock()
                    .write_page(key.table, key.pgid, &frame.buffer)?;
                frame.dirty = false;
            }
        }
        self.files.lock().sync(table)
    }

    pub(crate) fn flush_all(&self) -> anyhow::Result<()> {
        let tables = self.files.lock().tables();
        for table in tables {
            self.flush_table(table)?;
        }
        Ok(())
    }

    /// Drops, without writing them back, all frames holding pages of the table numbered
    /// `from` and above. Those frames must not be pinned.
    pub(crate) fn discard(&self, table: TableId, from: u64) {
        let mut internal = self.internal.lock();
        let mut evictor = self.evictor.lock();
        for (frame_id, frame) in self.frames.iter().enumerate() {
            let mut frame = frame.lock();
            let Some(key) = frame.key else {
                continue;
            };
            if key.table != table || key.pgid.get() < from {
                continue;
            }
            assert_eq!(
                0,
                evictor.pin_count(frame_id),
                "discarding pinned page {:?} of table {:?}",
                key.pgid,
                key.table
            );
            internal.page_to_frame.remove(&key);
            frame.key = None;
            frame.dirty = false;
            evictor.invalidated(frame_id);
        }
    }

    /// Shrinks the table to `page_count` pages, both in the pool and on disk.
    pub(crate) fn truncate(&self, table: TableId, page_count: u64) -> anyhow::Result<()> {
        log::debug!("truncate {table:?} to {page_count} pages");
        self.discard(table, page_count);
        self.files.lock().set_len(table, page_count)
    }

    /// Flushes the table and removes all of its pages from the pool.
    pub(crate) fn evict_table(&self, table: TableId) -> anyhow::Result<()> {
        self.flush_table(table)?;
        self.discard(table, 0);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_resident(&self, table: TableId, pgid: PageId) -> bool {
        self.internal
            .lock()
            .page_to_frame
            .contains_key(&FrameKey { table, pgid })
    }

    #[cfg(test)]
    pub(crate) fn pinned_frames(&self) -> usize {
        let evictor = self.evictor.lock();
        (0..self.frames.len())
            .filter(|frame_id| evictor.pin_count(*frame_id) > 0)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn resident_tables(&self) -> std::collections::HashSet<TableId> {
        self.internal
            .lock()
            .page_to_frame
            .keys()
            .map(|key| key.table)
            .collect()
    }
}

/// A pinned page. The frame stays pinned, and therefore cannot be evicted, until the guard is
/// dropped.
pub(crate) struct PageGuard<'a> {
    pool: &'a BufferPool,
    frame_id: usize,
    key: FrameKey,
}

impl<'a> PageGuard<'a> {
    pub(crate) fn read<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        let frame = self.pool.frames[self.frame_id].lock();
        debug_assert_eq!(Some(self.key), frame.key);
        f(&frame.buffer)
    }

    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> T {
        let mut frame = self.pool.frames[self.frame_id].lock();
        debug_assert_eq!(Some(self.key), frame.key);
        frame.dirty = true;
        f(&mut frame.buffer)
    }

    pub(crate) fn load(&self) -> anyhow::Result<Node> {
        self.read(Node::decode)
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.pool.release(self.frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::Path;

    fn open_file(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let table = TableId::new(1);
        let pool = BufferPool::new(10);
        pool.register_file(table, open_file(&dir.path().join("table")));

        let guards = (0..10)
            .map(|i| pool.pin(table, PageId::new(i)).unwrap())
            .collect::<Vec<_>>();
        assert!(pool.pin(table, PageId::new(10)).is_err(), "all frames are pinned");

        // release in the order 3, 0, 1, 2, 4, ..., 9
        let mut guards = guards.into_iter().map(Some).collect::<Vec<_>>();
        guards[3].take();
        for guard in guards.iter_mut() {
            guard.take();
        }
        assert_eq!(0, pool.pinned_frames());

        let page = pool.pin(table, PageId::new(10)).unwrap();
        assert!(!pool.is_resident(table, PageId::new(3)));
        assert!(pool.is_resident(table, PageId::new(0)));
        drop(page);

        let page = pool.pin(table, PageId::new(11)).unwrap();
        assert!(!pool.is_resident(table, PageId::new(0)));
        assert!(pool.is_resident(table, PageId::new(1)));
        drop(page);

        // a hit moves the page to the back of the list
        drop(pool.pin(table, PageId::new(1)).unwrap());
        drop(pool.pin(table, PageId::new(12)).unwrap());
        assert!(pool.is_resident(table, PageId::new(1)));
        assert!(!pool.is_resident(table, PageId::new(2)));
    }

    #[test]
    fn test_dirty_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        let table = TableId::new(1);
        let pool = BufferPool::new(10);
        pool.register_file(table, open_file(&path));

        let page = pool.pin(table, PageId::new(2)).unwrap();
        page.write(|buff| buff.fill(0x42));
        drop(page);
        assert_eq!(0, std::fs::metadata(&path).unwrap().len());

        for i in 3..13 {
            let page = pool.pin(table, PageId::new(i)).unwrap();
            page.read(|buff| assert!(buff.iter().all(|b| *b == 0)));
        }
        assert!(!pool.is_resident(table, PageId::new(2)));

        let mut f = open_file(&path);
        let mut buff = vec![0u8; PAGE_SIZE];
        f.seek(SeekFrom::Start(2 * PAGE_SIZE as u64)).unwrap();
        f.read_exact(&mut buff).unwrap();
        assert!(buff.iter().all(|b| *b == 0x42));

        let page = pool.pin(table, PageId::new(2)).unwrap();
        page.read(|buff| assert!(buff.iter().all(|b| *b == 0x42)));
    }

    #[test]
    fn test_truncate_and_evict_table() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(10);
        let t1 = TableId::new(1);
        let t2 = TableId::new(2);
        pool.register_file(t1, open_file(&dir.path().join("t1")));
        pool.register_file(t2, open_file(&dir.path().join("t2")));

        for i in 0..4 {
            pool.pin(t1, PageId::new(i)).unwrap().write(|buff| buff.fill(1));
            pool.pin(t2, PageId::new(i)).unwrap().write(|buff| buff.fill(2));
        }

        pool.truncate(t1, 2).unwrap();
        assert!(pool.is_resident(t1, PageId::new(1)));
        assert!(!pool.is_resident(t1, PageId::new(2)));
        assert!(!pool.is_resident(t1, PageId::new(3)));

        pool.evict_table(t1).unwrap();
        assert_eq!(HashSet::from([t2]), pool.resident_tables());
        let f = pool.unregister_file(t1).unwrap();
        assert_eq!(2 * PAGE_SIZE as u64, f.metadata().unwrap().len());

        pool.flush_all().unwrap();
        let len = std::fs::metadata(dir.path().join("t2")).unwrap().len();
        assert_eq!(4 * PAGE_SIZE as u64, len);
    }
}
