use crate::id::TableId;
use crate::table::Table;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) const MAX_TABLES: u32 = 10;

/// Every table that is currently open, keyed by its id.
#[derive(Default)]
pub(crate) struct Catalog {
    tables: HashMap<TableId, Mutex<Table>>,
    paths: HashMap<PathBuf, TableId>,
}

impl Catalog {
    /// The lowest id that is not in use, or an error when all of them are taken.
    pub(crate) fn next_id(&self) -> anyhow::Result<TableId> {
        (1..=MAX_TABLES)
            .map(TableId::new)
            .find(|id| !self.tables.contains_key(id))
            .ok_or_else(|| anyhow!("cannot open more than {MAX_TABLES} tables"))
    }

    pub(crate) fn find_path(&self, path: &Path) -> Option<TableId> {
        self.paths.get(path).copied()
    }

    pub(crate) fn insert(&mut self, table: Table) {
        let id = table.id;
        assert!(!self.tables.contains_key(&id), "{id:?} is already open");
        self.paths.insert(table.path.clone(), id);
        self.tables.insert(id, Mutex::new(table));
    }

    pub(crate) fn get(&self, id: TableId) -> anyhow::Result<&Mutex<Table>> {
        self.tables
            .get(&id)
            .ok_or_else(|| anyhow!("table {} is not open", id.get()))
    }

    pub(crate) fn remove(&mut self, id: TableId) -> anyhow::Result<Table> {
        let table = self
            .tables
            .remove(&id)
            .ok_or_else(|| anyhow!("table {} is not open", id.get()))?
            .into_inner();
        self.paths.remove(&table.path);
        Ok(table)
    }

    pub(crate) fn ids(&self) -> Vec<TableId> {
        let mut ids = self.tables.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

/// Two spellings of the same file must map to the same table. The file itself may not exist
/// yet, so only its directory is resolved.
pub(crate) fn normalize_path(path: &Path) -> anyhow::Result<PathBuf> {
    let Some(name) = path.file_name() else {
        return Err(anyhow!("{path:?} does not name a file"));
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok(dir.canonicalize()?.join(name))
}
