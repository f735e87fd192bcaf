use crate::db::Setting;
use crate::id::TableId;
use crate::pager::BufferPool;
use crate::table::{Table, TableIo};
use tempfile::TempDir;

/// A freshly created table living in its own temporary directory.
pub(crate) struct TestTable {
    pub(crate) pool: BufferPool,
    pub(crate) table: Table,
    _dir: TempDir,
}

impl TestTable {
    pub(crate) fn new(frames: usize) -> Self {
        Self::with_setting(Setting {
            buffer_frames: frames,
            wal: false,
            ..Setting::default()
        })
    }

    pub(crate) fn with_setting(setting: Setting) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(setting.buffer_frames);
        let table = Table::open(&pool, TableId::new(1), dir.path().join("table"), &setting).unwrap();
        Self {
            pool,
            table,
            _dir: dir,
        }
    }

    pub(crate) fn io(&mut self) -> TableIo<'_> {
        TableIo::new(&self.pool, &mut self.table)
    }
}
