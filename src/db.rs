use crate::btree::BTree;
use crate::catalog::{normalize_path, Catalog};
use crate::id::TableId;
use crate::pager::{BufferPool, Value};
use crate::table::{Table, TableIo};
use anyhow::anyhow;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage engine instance: one buffer pool shared by every open table.
pub struct Db {
    pool: BufferPool,
    catalog: RwLock<Catalog>,
    setting: Setting,
    poisoned: AtomicBool,
}

#[derive(Clone, Debug)]
pub struct Setting {
    /// Number of page frames in the buffer pool.
    pub buffer_frames: usize,
    /// Whether every table keeps a write-ahead log. Transactions need it.
    pub wal: bool,
    pub wal_buffer_size: usize,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            buffer_frames: 1000,
            wal: true,
            wal_buffer_size: 5 * 4096,
        }
    }
}

impl Setting {
    fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_frames < 10 {
            return Err(anyhow!("buffer pool can't have less than 10 frames"));
        }
        if self.wal_buffer_size < 4096 {
            return Err(anyhow!("wal buffer can't be smaller than 4096 bytes"));
        }
        Ok(())
    }
}

impl Db {
    pub fn init(setting: Setting) -> anyhow::Result<Self> {
        setting.validate()?;
        log::debug!("init database with {setting:?}");
        Ok(Self {
            pool: BufferPool::new(setting.buffer_frames),
            catalog: RwLock::new(Catalog::default()),
            setting,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Opens the table stored at `path`, creating the file when it doesn't exist.
    pub fn open_table(&self, path: impl AsRef<Path>) -> anyhow::Result<TableId> {
        self.check_poisoned()?;
        let path = normalize_path(path.as_ref())?;

        let mut catalog = self.catalog.write();
        if let Some(id) = catalog.find_path(&path) {
            return Err(anyhow!("{path:?} is already open as table {}", id.get()));
        }
        let id = catalog.next_id()?;
        let table = Table::open(&self.pool, id, path, &self.setting)?;
        catalog.insert(table);
        Ok(id)
    }

    /// Aborts the active transaction, gives trailing free pages back and writes everything
    /// of the table to disk. The id can be reused afterwards.
    pub fn close_table(&self, id: TableId) -> anyhow::Result<()> {
        self.check_poisoned()?;
        // the catalog stays locked until the file is detached from the pool, so neither the id
        // nor the path can be opened again before the table is fully written
        let mut catalog = self.catalog.write();
        let table = catalog.remove(id)?;
        let result = self.close(table);
        drop(catalog);
        self.poison_on_error(result)
    }

    fn close(&self, mut table: Table) -> anyhow::Result<()> {
        let id = table.id;
        let mut io = TableIo::new(&self.pool, &mut table);
        if io.table.tx.is_some() {
            log::debug!("table {id:?} is closed with an active transaction");
            io.abort_transaction()?;
        }
        io.clean_free_pages()?;
        let page_count = io.header().page_count;

        self.pool.evict_table(id)?;
        self.pool.unregister_file(id);
        if let Some(wal) = table.wal.take() {
            wal.close()?;
        }
        log::info!(
            "closed table {id:?} at {:?} with {page_count} pages",
            table.path
        );
        Ok(())
    }

    /// Returns false when the key already exists. The existing value is kept.
    ///
    /// Values are stored zero padded to [`VALUE_SIZE`](crate::VALUE_SIZE) bytes, so trailing
    /// zero bytes of `value` are not preserved by [`Value::as_bytes`].
    pub fn insert(&self, id: TableId, key: i64, value: &[u8]) -> anyhow::Result<bool> {
        let value = Value::new(value)?;
        self.mutate(id, |io| BTree::new(io).insert(key, value))
    }

    /// [`Value::raw`] returns the stored bytes including the padding.
    pub fn find(&self, id: TableId, key: i64) -> anyhow::Result<Option<Value>> {
        self.read(id, |io| BTree::new(io).get(key))
    }

    /// Returns false when the key doesn't exist.
    pub fn delete(&self, id: TableId, key: i64) -> anyhow::Result<bool> {
        self.mutate(id, |io| BTree::new(io).delete(key))
    }

    /// Every record of the table in key order.
    pub fn scan(&self, id: TableId) -> anyhow::Result<Vec<(i64, Value)>> {
        self.read(id, |io| BTree::new(io).scan())
    }

    pub fn verify(&self, id: TableId) -> anyhow::Result<()> {
        self.read(id, |io| BTree::new(io).verify())
    }

    /// Shrinks the table file by dropping the free pages at its end.
    pub fn clean(&self, id: TableId) -> anyhow::Result<()> {
        self.mutate_checked(
            id,
            |table| {
                if table.tx.is_some() {
                    return Err(anyhow!(
                        "table {} can't be cleaned during a transaction",
                        id.get()
                    ));
                }
                Ok(())
            },
            |mut io| io.clean_free_pages(),
        )
    }

    pub fn page_count(&self, id: TableId) -> anyhow::Result<u64> {
        self.read(id, |io| Ok(io.header().page_count))
    }

    pub fn begin_transaction(&self, id: TableId) -> anyhow::Result<()> {
        self.mutate_checked(
            id,
            |table| {
                if table.wal.is_none() {
                    return Err(anyhow!("write-ahead log is disabled"));
                }
                if table.tx.is_some() {
                    return Err(anyhow!(
                        "table {} already has an active transaction",
                        id.get()
                    ));
                }
                Ok(())
            },
            |mut io| io.begin_transaction().map(|_| ()),
        )
    }

    pub fn commit_transaction(&self, id: TableId) -> anyhow::Result<()> {
        self.mutate_checked(id, Self::require_transaction, |mut io| {
            io.commit_transaction()
        })
    }

    /// Undoes every change made to the table since `begin_transaction`.
    pub fn abort_transaction(&self, id: TableId) -> anyhow::Result<()> {
        self.mutate_checked(id, Self::require_transaction, |mut io| {
            io.abort_transaction()
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Closes every open table and writes all remaining dirty pages.
    pub fn shutdown(self) -> anyhow::Result<()> {
        self.close_all()
    }

    fn close_all(&self) -> anyhow::Result<()> {
        let ids = self.catalog.read().ids();
        for id in ids {
            self.close_table(id)?;
        }
        self.pool.flush_all()
    }

    fn require_transaction(table: &Table) -> anyhow::Result<()> {
        if table.tx.is_none() {
            return Err(anyhow!("table {} has no active transaction", table.id.get()));
        }
        Ok(())
    }

    fn read<T>(
        &self,
        id: TableId,
        f: impl FnOnce(TableIo<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let catalog = self.catalog.read();
        let mut table = catalog.get(id)?.lock();
        f(TableIo::new(&self.pool, &mut *table))
    }

    fn mutate<T>(
        &self,
        id: TableId,
        f: impl FnOnce(TableIo<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.mutate_checked(id, |_| Ok(()), f)
    }

    /// Runs `f` against the table. An error returned by `precondition` is the caller's mistake
    /// and leaves the database usable, while an error from `f` may leave pages half written
    /// and poisons the database.
    fn mutate_checked<T>(
        &self,
        id: TableId,
        precondition: impl FnOnce(&Table) -> anyhow::Result<()>,
        f: impl FnOnce(TableIo<'_>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.check_poisoned()?;
        let catalog = self.catalog.read();
        let mut table = catalog.get(id)?.lock();
        precondition(&*table)?;
        let result = f(TableIo::new(&self.pool, &mut *table));
        self.poison_on_error(result)
    }

    fn check_poisoned(&self) -> anyhow::Result<()> {
        if self.is_poisoned() {
            return Err(anyhow!("database is poisoned by a previous fatal error"));
        }
        Ok(())
    }

    fn poison_on_error<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(err) = &result {
            log::error!("database is poisoned: {err}");
            self.poisoned.store(true, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.is_poisoned() {
            log::error!("poisoned database is dropped without writing its pages");
            return;
        }
        if let Err(err) = self.close_all() {
            log::error!("cannot shutdown database: {err}");
        }
    }
}
