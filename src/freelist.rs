use crate::id::PageId;
use crate::pager::{
    init_free, init_in_use, is_free_layout, read_link, FREE_LIST_HEAD, INITIAL_ROOT,
};
use crate::table::TableIo;

/// In-memory summary of the free page chain hanging off the dummy head page. The chain itself
/// lives in the pages, threaded through their link field, and always ends at `tail`, which is
/// also the last page of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FreeList {
    capacity: u64,
    tail: PageId,
}

impl Default for FreeList {
    fn default() -> Self {
        Self {
            capacity: 0,
            tail: FREE_LIST_HEAD,
        }
    }
}

impl FreeList {
    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn tail(&self) -> PageId {
        self.tail
    }
}

impl<'a> TableIo<'a> {
    fn read_link(&self, pgid: PageId) -> anyhow::Result<Option<PageId>> {
        self.read_page(pgid, read_link)?
    }

    fn is_free_page(&self, pgid: PageId) -> anyhow::Result<bool> {
        self.read_page(pgid, is_free_layout)
    }

    /// Rebuilds the free list summary from the pages. A table whose chain is empty gets one
    /// fresh free page appended.
    pub(crate) fn init_free_list(&mut self) -> anyhow::Result<()> {
        let page_count = self.header().page_count;
        let mut link = self.read_link(FREE_LIST_HEAD)?;

        if link.is_none() {
            let pgid = PageId::new(page_count);
            self.set_header(|header| header.page_count += 1)?;
            self.write_page(pgid, |buff| init_free(buff, None))?;
            self.write_page(FREE_LIST_HEAD, |buff| init_free(buff, Some(pgid)))?;
            self.table.freelist = FreeList {
                capacity: 1,
                tail: pgid,
            };
            return Ok(());
        }

        let mut capacity = 0;
        let mut tail = FREE_LIST_HEAD;
        while let Some(pgid) = link {
            capacity += 1;
            if capacity >= page_count {
                return Err(anyhow::anyhow!(
                    "free list of {:?} is longer than the table itself",
                    self.id()
                ));
            }
            if pgid.get() >= page_count {
                return Err(anyhow::anyhow!(
                    "free list of {:?} points to page {pgid:?} beyond page_count={page_count}",
                    self.id()
                ));
            }
            tail = pgid;
            link = self.read_link(pgid)?;
        }

        self.table.freelist = FreeList { capacity, tail };
        log::trace!(
            "free list of {:?} has {capacity} pages ending at {tail:?}",
            self.id()
        );
        Ok(())
    }

    /// Hands out a page from the head of the free list. The page comes back empty but marked
    /// as in use.
    pub(crate) fn alloc_page(&mut self) -> anyhow::Result<PageId> {
        assert!(
            self.table.freelist.capacity >= 1,
            "free list of {:?} is empty",
            self.id()
        );
        if self.table.freelist.capacity == 1 {
            let count = self.header().page_count;
            self.grow(count)?;
        }

        let Some(pgid) = self.read_link(FREE_LIST_HEAD)? else {
            panic!(
                "free list head of {:?} is empty while capacity is {}",
                self.id(),
                self.table.freelist.capacity
            );
        };
        let next = self.read_link(pgid)?;
        self.write_page(FREE_LIST_HEAD, |buff| init_free(buff, next))?;
        self.write_page(pgid, init_in_use)?;
        self.table.freelist.capacity -= 1;

        log::trace!("alloc {:?} {pgid:?}", self.id());
        Ok(pgid)
    }

    /// Pushes a page that is in use back onto the head of the free list.
    pub(crate) fn free_page(&mut self, pgid: PageId) -> anyhow::Result<()> {
        assert!(
            pgid > FREE_LIST_HEAD,
            "page {pgid:?} can't be put in the free list"
        );
        assert!(
            !self.is_free_page(pgid)?,
            "page {pgid:?} of {:?} is already free",
            self.id()
        );

        let head = self.read_link(FREE_LIST_HEAD)?;
        self.write_page(pgid, |buff| init_free(buff, head))?;
        self.write_page(FREE_LIST_HEAD, |buff| init_free(buff, Some(pgid)))?;
        self.table.freelist.capacity += 1;

        log::trace!("free {:?} {pgid:?}", self.id());
        Ok(())
    }

    /// Appends `count` free pages to the end of the file, after the current tail.
    fn grow(&mut self, count: u64) -> anyhow::Result<()> {
        let start = self.header().page_count;
        log::debug!(
            "growing {:?} from {start} to {} pages",
            self.id(),
            start + count
        );

        self.set_header(|header| header.page_count += count)?;
        let tail = self.table.freelist.tail;
        self.write_page(tail, |buff| init_free(buff, Some(PageId::new(start))))?;
        for i in start..start + count {
            let next = if i + 1 < start + count {
                Some(PageId::new(i + 1))
            } else {
                None
            };
            self.write_page(PageId::new(i), |buff| init_free(buff, next))?;
        }

        self.table.freelist.tail = PageId::new(start + count - 1);
        self.table.freelist.capacity += count;
        Ok(())
    }

    /// Gives the run of free pages at the end of the file back to the file system, keeping a
    /// single free page as the new tail.
    pub(crate) fn clean_free_pages(&mut self) -> anyhow::Result<()> {
        let page_count = self.header().page_count;
        let last = PageId::new(page_count - 1);
        assert_eq!(
            self.table.freelist.tail,
            last,
            "the free list tail of {:?} must be the last page",
            self.id()
        );

        let mut last_content = last.get();
        while last_content > INITIAL_ROOT.get() && self.is_free_page(PageId::new(last_content))? {
            last_content -= 1;
        }
        let new_tail = PageId::new(last_content + 1);
        if new_tail == last {
            return Ok(());
        }

        let mut prev = FREE_LIST_HEAD;
        let mut link = self.read_link(FREE_LIST_HEAD)?;
        let mut capacity = 0;
        while let Some(pgid) = link {
            let next = self.read_link(pgid)?;
            if pgid.get() > last_content {
                self.write_page(prev, |buff| init_free(buff, next))?;
            } else {
                prev = pgid;
                capacity += 1;
            }
            link = next;
        }
        self.write_page(prev, |buff| init_free(buff, Some(new_tail)))?;
        self.write_page(new_tail, |buff| init_free(buff, None))?;

        let new_page_count = new_tail.get() + 1;
        self.table.freelist = FreeList {
            capacity: capacity + 1,
            tail: new_tail,
        };
        self.set_header(|header| header.page_count = new_page_count)?;
        self.pool().truncate(self.id(), new_page_count)?;

        log::debug!(
            "cleaned {:?} from {page_count} to {new_page_count} pages",
            self.id()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestTable;

    #[test]
    fn test_free_page_reuse() {
        let mut t = TestTable::new(10);
        let mut io = t.io();
        io.alloc_page().unwrap();
        let capacity = io.table.freelist.capacity();

        let p = io.alloc_page().unwrap();
        io.free_page(p).unwrap();
        assert_eq!(capacity, io.table.freelist.capacity());
        assert_eq!(p, io.alloc_page().unwrap());
        assert_eq!(capacity - 1, io.table.freelist.capacity());
    }

    #[test]
    fn test_grow_doubles_the_table() {
        let mut t = TestTable::new(10);
        let mut io = t.io();
        assert_eq!(4, io.header().page_count);
        assert_eq!(1, io.table.freelist.capacity());

        assert_eq!(PageId::new(3), io.alloc_page().unwrap());
        assert_eq!(8, io.header().page_count);
        assert_eq!(4, io.table.freelist.capacity());
        assert_eq!(PageId::new(7), io.table.freelist.tail());

        for i in 4..7 {
            assert_eq!(PageId::new(i), io.alloc_page().unwrap());
        }
        assert_eq!(8, io.header().page_count);
        assert_eq!(PageId::new(7), io.alloc_page().unwrap());
        assert_eq!(16, io.header().page_count);
        assert_eq!(PageId::new(15), io.table.freelist.tail());
    }

    #[test]
    fn test_clean_restores_page_count() {
        let mut t = TestTable::new(10);
        let mut io = t.io();
        let before = io.header().page_count;

        let pages = (0..11)
            .map(|_| io.alloc_page().unwrap())
            .collect::<Vec<_>>();
        assert!(io.header().page_count > before);
        for pgid in pages {
            io.free_page(pgid).unwrap();
        }
        io.clean_free_pages().unwrap();

        assert_eq!(before, io.header().page_count);
        assert_eq!(1, io.table.freelist.capacity());
        assert_eq!(PageId::new(before - 1), io.table.freelist.tail());

        io.init_free_list().unwrap();
        assert_eq!(1, io.table.freelist.capacity());
        assert_eq!(before, io.header().page_count);
    }

    #[test]
    fn test_clean_keeps_pages_in_use() {
        let mut t = TestTable::new(10);
        let mut io = t.io();
        let pages = (0..11)
            .map(|_| io.alloc_page().unwrap())
            .collect::<Vec<_>>();
        // keep 3..=5 and 8 in use, free everything else
        for pgid in pages.iter().copied() {
            if ![3, 4, 5, 8].contains(&pgid.get()) {
                io.free_page(pgid).unwrap();
            }
        }
        io.clean_free_pages().unwrap();

        assert_eq!(10, io.header().page_count);
        assert_eq!(PageId::new(9), io.table.freelist.tail());
        // pages 6 and 7 are interior free pages and stay in the list with the new tail
        assert_eq!(3, io.table.freelist.capacity());
        let mut allocated = (0..3).map(|_| io.alloc_page().unwrap()).collect::<Vec<_>>();
        allocated.sort();
        assert_eq!(
            vec![PageId::new(6), PageId::new(7), PageId::new(9)],
            allocated
        );
    }

    #[test]
    #[should_panic]
    fn test_double_free() {
        let mut t = TestTable::new(10);
        let mut io = t.io();
        let p = io.alloc_page().unwrap();
        io.free_page(p).unwrap();
        io.free_page(p).unwrap();
    }
}
