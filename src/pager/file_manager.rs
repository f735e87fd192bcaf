use crate::id::{PageId, TableId};
use crate::pager::PAGE_SIZE;
use anyhow::anyhow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// Owns the data file of every open table and performs the actual page I/O for the buffer
/// pool.
pub(crate) struct FileManager {
    files: HashMap<TableId, File>,
}

impl FileManager {
    pub(crate) fn new() -> Self {
        Self {
            files: HashMap::default(),
        }
    }

    pub(crate) fn register(&mut self, table: TableId, file: File) {
        let old = self.files.insert(table, file);
        assert!(old.is_none(), "table {table:?} is already registered");
    }

    pub(crate) fn unregister(&mut self, table: TableId) -> Option<File> {
        self.files.remove(&table)
    }

    fn file(&mut self, table: TableId) -> anyhow::Result<&mut File> {
        self.files
            .get_mut(&table)
            .ok_or_else(|| anyhow!("table {table:?} has no open file"))
    }

    /// Fills `buff` with the page content. Returns false when the page lies beyond the end of
    /// the file, in which case `buff` is left untouched.
    pub(crate) fn read_page(
        &mut self,
        table: TableId,
        pgid: PageId,
        buff: &mut [u8],
    ) -> anyhow::Result<bool> {
        assert_eq!(PAGE_SIZE, buff.len());
        let f = self.file(table)?;
        let file_size = f.metadata()?.len();
        let min_size = pgid.offset() + PAGE_SIZE as u64;
        if min_size > file_size {
            return Ok(false);
        }
        f.seek(SeekFrom::Start(pgid.offset()))?;
        f.read_exact(buff)?;
        Ok(true)
    }

    pub(crate) fn write_page(
        &mut self,
        table: TableId,
        pgid: PageId,
        buff: &[u8],
    ) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let f = self.file(table)?;
        let file_size = f.metadata()?.len();
        let min_size = pgid.offset() + PAGE_SIZE as u64;
        if min_size > file_size {
            f.set_len(min_size)?;
        }
        f.seek(SeekFrom::Start(pgid.offset()))?;
        f.write_all(buff)?;
        Ok(())
    }

    pub(crate) fn set_len(&mut self, table: TableId, page_count: u64) -> anyhow::Result<()> {
        let f = self.file(table)?;
        f.set_len(page_count * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub(crate) fn sync(&mut self, table: TableId) -> anyhow::Result<()> {
        self.file(table)?.sync_all()?;
        Ok(())
    }

    pub(crate) fn tables(&self) -> Vec<TableId> {
        self.files.keys().copied().collect()
    }
}
