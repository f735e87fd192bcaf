use crate::id::{Lsn, PageId, TxId};
use crate::pager::{HeaderPage, HEADER_PAGE};
use crate::table::{ActiveTx, TableIo};
use crate::wal::{Wal, WalRecord};
use anyhow::anyhow;

impl<'a> TableIo<'a> {
    pub(crate) fn begin_transaction(&mut self) -> anyhow::Result<TxId> {
        assert!(
            self.table.tx.is_none(),
            "{:?} already has an active transaction",
            self.id()
        );
        let Some(wal) = self.table.wal.as_mut() else {
            return Err(anyhow!("write-ahead log is disabled"));
        };

        let txid = wal.next_txid();
        let last_lsn = wal.append(txid, None, WalRecord::Begin)?;
        self.table.tx = Some(ActiveTx { txid, last_lsn });
        log::debug!("begin transaction {txid:?} on {:?}", self.id());
        Ok(txid)
    }

    pub(crate) fn commit_transaction(&mut self) -> anyhow::Result<()> {
        let (tx, wal) = self.finish_transaction();
        wal.append(tx.txid, Some(tx.last_lsn), WalRecord::Commit)?;
        wal.sync()?;
        log::debug!("commit transaction {:?}", tx.txid);
        Ok(())
    }

    /// Rolls the table back to the state it had when the transaction began. The before images
    /// are applied newest first, then the header and free list are reloaded from the restored
    /// pages and the file is truncated to the restored page count.
    pub(crate) fn abort_transaction(&mut self) -> anyhow::Result<()> {
        let (tx, wal) = self.finish_transaction();
        wal.flush()?;
        let undo = collect_undo(wal, tx)?;

        // the transaction is already detached from the table, so these writes are not logged
        for item in &undo {
            let range = item.offset..item.offset + item.before.len();
            self.write_page(item.pgid, |buff| buff[range].copy_from_slice(&item.before))?;
        }

        let Some(wal) = self.table.wal.as_mut() else {
            unreachable!();
        };
        wal.append(tx.txid, Some(tx.last_lsn), WalRecord::Abort)?;
        wal.sync()?;

        let header = self.read_page(HEADER_PAGE, HeaderPage::decode)??;
        self.table.header = header;
        self.init_free_list()?;
        let page_count = self.header().page_count;
        self.pool().truncate(self.id(), page_count)?;

        log::debug!(
            "abort transaction {:?}, {} updates undone",
            tx.txid,
            undo.len()
        );
        Ok(())
    }

    fn finish_transaction(&mut self) -> (ActiveTx, &mut Wal) {
        let Some(tx) = self.table.tx.take() else {
            panic!("{:?} has no active transaction", self.table.id);
        };
        let Some(wal) = self.table.wal.as_mut() else {
            panic!("{:?} has a transaction but no write-ahead log", self.table.id);
        };
        (tx, wal)
    }
}

struct UndoItem {
    pgid: PageId,
    offset: usize,
    before: Vec<u8>,
}

/// Walks the records of `tx` from the last one back to its BEGIN.
fn collect_undo(wal: &mut Wal, tx: ActiveTx) -> anyhow::Result<Vec<UndoItem>> {
    let mut items = Vec::new();
    let mut buff = Vec::new();
    let mut lsn: Option<Lsn> = Some(tx.last_lsn);

    while let Some(current) = lsn {
        let Some(entry) = wal.read_at(current, &mut buff)? else {
            return Err(anyhow!("wal record at {current:?} is missing"));
        };
        if entry.txid != tx.txid {
            return Err(anyhow!(
                "wal record at {current:?} belongs to {:?}, expected {:?}",
                entry.txid,
                tx.txid
            ));
        }

        match entry.record {
            WalRecord::Begin => return Ok(items),
            WalRecord::Update {
                pgid,
                offset,
                before,
                ..
            } => items.push(UndoItem {
                pgid,
                offset: offset as usize,
                before: before.to_vec(),
            }),
            WalRecord::Commit | WalRecord::Abort => {
                return Err(anyhow!(
                    "transaction {:?} is already finished at {current:?}",
                    tx.txid
                ));
            }
        }
        lsn = entry.prev_lsn;
    }

    Err(anyhow!(
        "wal chain of transaction {:?} ends before its begin record",
        tx.txid
    ))
}

#[cfg(test)]
mod tests {
    use crate::btree::BTree;
    use crate::db::Setting;
    use crate::pager::Value;
    use crate::test_utils::TestTable;

    fn value(key: i64) -> Value {
        Value::new(format!("value-{key}").as_bytes()).unwrap()
    }

    fn wal_table() -> TestTable {
        TestTable::with_setting(Setting {
            buffer_frames: 10,
            ..Setting::default()
        })
    }

    #[test]
    fn test_commit_keeps_changes() {
        let mut t = wal_table();
        t.io().begin_transaction().unwrap();
        for key in 0..100 {
            BTree::new(t.io()).insert(key, value(key)).unwrap();
        }
        t.io().commit_transaction().unwrap();
        assert!(t.table.tx.is_none());

        let btree = BTree::new(t.io());
        btree.verify().unwrap();
        assert_eq!(100, btree.scan().unwrap().len());
    }

    #[test]
    fn test_abort_restores_tree_and_page_count() {
        let mut t = wal_table();
        for key in 0..40 {
            BTree::new(t.io()).insert(key, value(key)).unwrap();
        }
        let page_count = t.io().header().page_count;
        let before = BTree::new(t.io()).scan().unwrap();

        t.io().begin_transaction().unwrap();
        for key in 40..1000 {
            BTree::new(t.io()).insert(key, value(key)).unwrap();
        }
        for key in 0..20 {
            assert!(BTree::new(t.io()).delete(key).unwrap());
        }
        assert!(t.io().header().page_count > page_count);
        t.io().abort_transaction().unwrap();

        assert_eq!(page_count, t.io().header().page_count);
        let btree = BTree::new(t.io());
        btree.verify().unwrap();
        assert_eq!(before, btree.scan().unwrap());
        assert_eq!(None, btree.get(500).unwrap());
        assert_eq!(Some(value(3)), btree.get(3).unwrap());
    }

    #[test]
    fn test_consecutive_transactions() {
        let mut t = wal_table();
        let first = t.io().begin_transaction().unwrap();
        BTree::new(t.io()).insert(1, value(1)).unwrap();
        t.io().commit_transaction().unwrap();

        let second = t.io().begin_transaction().unwrap();
        assert!(second > first);
        BTree::new(t.io()).insert(2, value(2)).unwrap();
        t.io().abort_transaction().unwrap();

        let btree = BTree::new(t.io());
        assert_eq!(Some(value(1)), btree.get(1).unwrap());
        assert_eq!(None, btree.get(2).unwrap());
        btree.verify().unwrap();
    }

    #[test]
    fn test_begin_without_wal() {
        let mut t = TestTable::new(10);
        assert!(t.io().begin_transaction().is_err());
    }
}
