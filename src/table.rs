use crate::db::Setting;
use crate::freelist::FreeList;
use crate::id::{Lsn, PageId, TableId, TxId};
use crate::pager::{
    init_free, BufferPool, HeaderPage, LeafNode, Node, FREE_LIST_HEAD, HEADER_PAGE,
    INITIAL_PAGE_COUNT, INITIAL_ROOT, PAGE_SIZE,
};
use crate::wal::{Wal, WalRecord};
use anyhow::anyhow;
use std::fs::OpenOptions;
use std::ops::Range;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ActiveTx {
    pub(crate) txid: TxId,
    pub(crate) last_lsn: Lsn,
}

/// Per-table state kept for as long as the table is open.
pub(crate) struct Table {
    pub(crate) id: TableId,
    pub(crate) path: PathBuf,
    pub(crate) header: HeaderPage,
    pub(crate) freelist: FreeList,
    pub(crate) wal: Option<Wal>,
    pub(crate) tx: Option<ActiveTx>,
}

impl Table {
    pub(crate) fn open(
        pool: &BufferPool,
        id: TableId,
        path: PathBuf,
        setting: &Setting,
    ) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !file.metadata()?.is_file() {
            return Err(anyhow!("table file {path:?} is not a regular file"));
        }
        let file_size = file.metadata()?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            return Err(anyhow!(
                "table file {path:?} has size {file_size} which is not a multiple of the page size"
            ));
        }

        pool.register_file(id, file);
        let mut table = Self {
            id,
            path,
            header: HeaderPage::initial(),
            freelist: FreeList::default(),
            wal: None,
            tx: None,
        };
        if let Err(err) = table.load(pool, file_size, setting) {
            pool.discard(id, 0);
            pool.unregister_file(id);
            return Err(err);
        }

        log::info!(
            "opened table {id:?} at {:?} with {} pages",
            table.path,
            table.header.page_count
        );
        Ok(table)
    }

    fn load(&mut self, pool: &BufferPool, file_size: u64, setting: &Setting) -> anyhow::Result<()> {
        let mut io = TableIo::new(pool, self);
        if file_size == 0 {
            io.initialize()?;
        } else {
            let header = io.read_page(HEADER_PAGE, HeaderPage::decode)??;
            Self::validate_header(&header, file_size)?;
            io.table.header = header;
        }
        io.init_free_list()?;

        if setting.wal {
            self.wal = Some(Wal::open(
                &Wal::path_for(&self.path),
                setting.wal_buffer_size,
            )?);
        }
        Ok(())
    }

    fn validate_header(header: &HeaderPage, file_size: u64) -> anyhow::Result<()> {
        if header.free_list != FREE_LIST_HEAD {
            return Err(anyhow!(
                "free list must start at {FREE_LIST_HEAD:?}, but header points to {:?}",
                header.free_list
            ));
        }
        if header.page_count < INITIAL_PAGE_COUNT {
            return Err(anyhow!(
                "table must have at least {INITIAL_PAGE_COUNT} pages, but header says {}",
                header.page_count
            ));
        }
        if header.root < INITIAL_ROOT || header.root.get() >= header.page_count {
            return Err(anyhow!(
                "root {:?} is out of bound since page_count={}",
                header.root,
                header.page_count
            ));
        }
        if file_size != header.page_count * PAGE_SIZE as u64 {
            return Err(anyhow!(
                "table file has {} pages, but header says {}",
                file_size / PAGE_SIZE as u64,
                header.page_count
            ));
        }
        Ok(())
    }
}

/// A table together with the buffer pool its pages live in. Every page access of a table goes
/// through here.
pub(crate) struct TableIo<'a> {
    pool: &'a BufferPool,
    pub(crate) table: &'a mut Table,
}

impl<'a> TableIo<'a> {
    pub(crate) fn new(pool: &'a BufferPool, table: &'a mut Table) -> Self {
        Self { pool, table }
    }

    pub(crate) fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    pub(crate) fn id(&self) -> TableId {
        self.table.id
    }

    pub(crate) fn header(&self) -> HeaderPage {
        self.table.header
    }

    fn initialize(&mut self) -> anyhow::Result<()> {
        log::debug!("initializing table {:?}", self.table.id);
        let header = HeaderPage::initial();
        self.table.header = header;
        self.write_page(HEADER_PAGE, |buff| {
            buff.fill(0);
            header.encode(buff);
        })?;
        self.write_page(FREE_LIST_HEAD, |buff| init_free(buff, None))?;
        self.store(INITIAL_ROOT, &Node::Leaf(LeafNode::empty()))?;
        Ok(())
    }

    pub(crate) fn read_page<T>(&self, pgid: PageId, f: impl FnOnce(&[u8]) -> T) -> anyhow::Result<T> {
        self.check_bound(pgid);
        let page = self.pool.pin(self.table.id, pgid)?;
        Ok(page.read(f))
    }

    /// Applies `f` to the page. While a transaction is active the change is appended to the
    /// write-ahead log before the frame is modified.
    pub(crate) fn write_page<T>(
        &mut self,
        pgid: PageId,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> anyhow::Result<T> {
        self.check_bound(pgid);
        let page = self.pool.pin(self.table.id, pgid)?;
        let (Some(tx), Some(wal)) = (self.table.tx.as_mut(), self.table.wal.as_mut()) else {
            return Ok(page.write(f));
        };

        let before = page.read(|buff| buff.to_vec());
        let mut after = before.clone();
        let result = f(&mut after);
        let Some(range) = changed_range(&before, &after) else {
            return Ok(result);
        };

        tx.last_lsn = wal.append(
            tx.txid,
            Some(tx.last_lsn),
            WalRecord::Update {
                pgid,
                offset: range.start as u16,
                before: &before[range.clone()],
                after: &after[range.clone()],
            },
        )?;
        page.write(|buff| buff[range.clone()].copy_from_slice(&after[range]));
        Ok(result)
    }

    pub(crate) fn load(&self, pgid: PageId) -> anyhow::Result<Node> {
        self.check_bound(pgid);
        let page = self.pool.pin(self.table.id, pgid)?;
        page.load()
            .map_err(|err| anyhow!("cannot decode page {pgid:?} of {:?}: {err}", self.table.id))
    }

    pub(crate) fn store(&mut self, pgid: PageId, node: &Node) -> anyhow::Result<()> {
        self.write_page(pgid, |buff| node.encode(buff))
    }

    pub(crate) fn set_header(&mut self, f: impl FnOnce(&mut HeaderPage)) -> anyhow::Result<()> {
        let mut header = self.table.header;
        f(&mut header);
        self.table.header = header;
        self.write_page(HEADER_PAGE, |buff| header.encode(buff))
    }

    fn check_bound(&self, pgid: PageId) {
        assert!(
            pgid.get() < self.table.header.page_count,
            "page {pgid:?} is out of bound since page_count={}",
            self.table.header.page_count,
        );
    }
}

fn changed_range(before: &[u8], after: &[u8]) -> Option<Range<usize>> {
    let start = before.iter().zip(after).position(|(a, b)| a != b)?;
    let tail = before
        .iter()
        .rev()
        .zip(after.iter().rev())
        .position(|(a, b)| a != b)?;
    Some(start..before.len() - tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_range() {
        let before = [0u8, 1, 2, 3, 4, 5];
        assert_eq!(None, changed_range(&before, &before));
        assert_eq!(Some(2..3), changed_range(&before, &[0, 1, 9, 3, 4, 5]));
        assert_eq!(Some(0..6), changed_range(&before, &[9, 1, 2, 3, 4, 9]));
    }

    #[test]
    fn test_fresh_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        let pool = BufferPool::new(10);
        let setting = Setting {
            wal: false,
            ..Setting::default()
        };
        let id = TableId::new(1);
        let mut table = Table::open(&pool, id, path.clone(), &setting).unwrap();
        assert_eq!(FREE_LIST_HEAD, table.header.free_list);
        assert_eq!(INITIAL_ROOT, table.header.root);
        assert_eq!(4, table.header.page_count, "one free page is appended on open");
        assert_eq!(1, table.freelist.capacity());

        let io = TableIo::new(&pool, &mut table);
        assert_eq!(Node::Leaf(LeafNode::empty()), io.load(INITIAL_ROOT).unwrap());
        drop(io);

        pool.evict_table(id).unwrap();
        pool.unregister_file(id).unwrap();
        let table = Table::open(&pool, id, path, &setting).unwrap();
        assert_eq!(4, table.header.page_count);
        assert_eq!(1, table.freelist.capacity());
    }

    #[test]
    fn test_reject_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        let pool = BufferPool::new(10);
        let setting = Setting::default();

        std::fs::write(&path, [1u8; 100]).unwrap();
        assert!(Table::open(&pool, TableId::new(1), path.clone(), &setting).is_err());

        let mut buff = vec![0u8; 4 * PAGE_SIZE];
        HeaderPage {
            free_list: FREE_LIST_HEAD,
            root: PageId::new(9),
            page_count: 4,
        }
        .encode(&mut buff);
        std::fs::write(&path, &buff).unwrap();
        assert!(Table::open(&pool, TableId::new(1), path.clone(), &setting).is_err());
        assert!(pool.unregister_file(TableId::new(1)).is_none());
    }

    #[test]
    fn test_reject_page_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        let pool = BufferPool::new(10);
        let setting = Setting {
            wal: false,
            ..Setting::default()
        };
        let id = TableId::new(1);

        let mut table = Table::open(&pool, id, path.clone(), &setting).unwrap();
        let mut io = TableIo::new(&pool, &mut table);
        for _ in 0..6 {
            io.alloc_page().unwrap();
        }
        let page_count = io.header().page_count;
        drop(io);
        pool.evict_table(id).unwrap();
        let file = pool.unregister_file(id).unwrap();
        assert_eq!(page_count * PAGE_SIZE as u64, file.metadata().unwrap().len());

        // the header claims more pages than the file holds
        file.set_len((page_count - 2) * PAGE_SIZE as u64).unwrap();
        assert!(Table::open(&pool, id, path.clone(), &setting).is_err());
        assert!(pool.unregister_file(id).is_none());

        // and fewer
        file.set_len((page_count + 2) * PAGE_SIZE as u64).unwrap();
        assert!(Table::open(&pool, id, path.clone(), &setting).is_err());

        file.set_len(page_count * PAGE_SIZE as u64).unwrap();
        let table = Table::open(&pool, id, path, &setting).unwrap();
        assert_eq!(page_count, table.header.page_count);
    }
}
