use crate::pager::PAGE_SIZE;
use std::num::NonZeroU64;

/// Identifier handed out by [`crate::Db::open_table`]. Ids are small integers that are reused
/// once the table holding them is closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TxId(NonZeroU64);

impl TxId {
    #[inline]
    pub(crate) fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    #[inline]
    pub(crate) fn next(&self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }

    #[inline]
    pub(crate) fn from_be_bytes(txid: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_be_bytes(txid))
    }

    #[inline]
    pub(crate) fn get(self) -> u64 {
        self.0.get()
    }
}

pub(crate) trait TxIdExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl TxIdExt for TxId {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.0.get().to_be_bytes()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Lsn(u64);

impl Lsn {
    #[inline]
    pub(crate) fn new(lsn: u64) -> Self {
        assert!(lsn != u64::MAX);
        Self(lsn)
    }

    #[inline]
    pub(crate) fn from_be_bytes(lsn: [u8; 8]) -> Option<Self> {
        let val = u64::from_be_bytes(lsn);
        if val == u64::MAX {
            None
        } else {
            Some(Self(val))
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
        assert!(self.0 != u64::MAX);
    }
}

pub(crate) trait LsnExt {
    fn to_be_bytes(&self) -> [u8; 8];
}

impl LsnExt for Lsn {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        self.get().to_be_bytes()
    }
}

impl LsnExt for Option<Lsn> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 8] {
        if let Some(lsn) = self {
            lsn.to_be_bytes()
        } else {
            [0xffu8; 8]
        }
    }
}

/// Page number inside a table file. On disk, page references are stored as byte offsets
/// (`page number * PAGE_SIZE`) where offset 0 means "no page"; the conversion lives here and
/// nowhere else.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PageId(u64);

impl PageId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn get(&self) -> u64 {
        self.0
    }

    pub(crate) fn offset(&self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }

    /// Returns `None` for the null offset. The caller is responsible for rejecting offsets
    /// that are not aligned to a page boundary.
    pub(crate) fn from_offset(offset: u64) -> Option<Self> {
        if offset == 0 {
            None
        } else {
            Some(Self(offset / PAGE_SIZE as u64))
        }
    }

    pub(crate) fn from_be_bytes(pgid: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(pgid))
    }
}

pub(crate) trait PageIdExt {
    fn to_le_offset(&self) -> [u8; 8];
}

impl PageIdExt for PageId {
    fn to_le_offset(&self) -> [u8; 8] {
        self.offset().to_le_bytes()
    }
}

impl PageIdExt for Option<PageId> {
    fn to_le_offset(&self) -> [u8; 8] {
        if let Some(pgid) = self {
            pgid.to_le_offset()
        } else {
            0u64.to_le_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offset() {
        assert_eq!(None, PageId::from_offset(0));
        assert_eq!(Some(PageId::new(3)), PageId::from_offset(3 * 4096));
        assert_eq!(8192, PageId::new(2).offset());
        assert_eq!([0u8; 8], None::<PageId>.to_le_offset());
        assert_eq!(
            4096u64.to_le_bytes(),
            Some(PageId::new(1)).to_le_offset(),
            "page references are stored as little endian byte offsets"
        );
    }

    #[test]
    fn test_lsn_none() {
        assert_eq!(None, Lsn::from_be_bytes(None::<Lsn>.to_be_bytes()));
        let lsn = Lsn::new(32);
        assert_eq!(Some(lsn), Lsn::from_be_bytes(lsn.to_be_bytes()));
    }
}
