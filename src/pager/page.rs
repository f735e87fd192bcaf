use crate::bins::SliceExt;
use crate::id::{PageId, PageIdExt};
use anyhow::anyhow;
use std::ops::Range;

pub(crate) const PAGE_SIZE: usize = 0x1000;
pub const VALUE_SIZE: usize = 120;

const PAGE_HEADER_SIZE: usize = 128;
const PAGE_HEADER_LINK_RANGE: Range<usize> = 0..8;
const PAGE_HEADER_IS_LEAF_RANGE: Range<usize> = 8..12;
const PAGE_HEADER_COUNT_RANGE: Range<usize> = 12..16;
const PAGE_HEADER_RESERVED_RANGE: Range<usize> = 16..120;
const PAGE_HEADER_SIBLING_RANGE: Range<usize> = 120..128;

const RECORD_SIZE: usize = 8 + VALUE_SIZE;
const RECORD_KEY_RANGE: Range<usize> = 0..8;
const RECORD_VALUE_RANGE: Range<usize> = 8..RECORD_SIZE;

const ENTRY_SIZE: usize = 16;
const ENTRY_KEY_RANGE: Range<usize> = 0..8;
const ENTRY_CHILD_RANGE: Range<usize> = 8..16;

pub(crate) const RECORD_PER_PAGE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / RECORD_SIZE;
pub(crate) const ENTRY_PER_PAGE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / ENTRY_SIZE;

// Working sizes of the overflow buffers built during a split: a full page plus the item
// being inserted.
pub(crate) const RECORD_ORDER: usize = RECORD_PER_PAGE + 1;
pub(crate) const ENTRY_ORDER: usize = ENTRY_PER_PAGE + 1;

const HEADER_FREE_LIST_RANGE: Range<usize> = 0..8;
const HEADER_ROOT_RANGE: Range<usize> = 8..16;
const HEADER_PAGE_COUNT_RANGE: Range<usize> = 16..24;

pub(crate) const HEADER_PAGE: PageId = PageId::new(0);
pub(crate) const FREE_LIST_HEAD: PageId = PageId::new(1);
pub(crate) const INITIAL_ROOT: PageId = PageId::new(2);
pub(crate) const INITIAL_PAGE_COUNT: u64 = 3;

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

const fn range_size(range: Range<usize>) -> usize {
    range.end - range.start
}

const_assert!(range_size(PAGE_HEADER_LINK_RANGE) == 8);
const_assert!(range_size(PAGE_HEADER_IS_LEAF_RANGE) == 4);
const_assert!(range_size(PAGE_HEADER_COUNT_RANGE) == 4);
const_assert!(PAGE_HEADER_RESERVED_RANGE.start == PAGE_HEADER_COUNT_RANGE.end);
const_assert!(PAGE_HEADER_RESERVED_RANGE.end == PAGE_HEADER_SIBLING_RANGE.start);
const_assert!(range_size(PAGE_HEADER_SIBLING_RANGE) == 8);
const_assert!(PAGE_HEADER_SIBLING_RANGE.end == PAGE_HEADER_SIZE);

const_assert!(range_size(RECORD_KEY_RANGE) == 8);
const_assert!(range_size(RECORD_VALUE_RANGE) == VALUE_SIZE);
const_assert!(range_size(ENTRY_KEY_RANGE) == 8);
const_assert!(ENTRY_CHILD_RANGE.end == ENTRY_SIZE);

const_assert!(PAGE_HEADER_SIZE + RECORD_PER_PAGE * RECORD_SIZE == PAGE_SIZE);
const_assert!(PAGE_HEADER_SIZE + ENTRY_PER_PAGE * ENTRY_SIZE == PAGE_SIZE);
const_assert!(RECORD_PER_PAGE == 31);
const_assert!(ENTRY_PER_PAGE == 248);

const_assert!(HEADER_PAGE_COUNT_RANGE.end <= PAGE_SIZE);

/// Number of items kept on the left side when `len` items are divided in two. Odd lengths
/// round up.
pub(crate) const fn cut(len: usize) -> usize {
    (len + 1) / 2
}

/// Fixed-width value stored next to every key. Shorter inputs are padded with zero bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value([u8; VALUE_SIZE]);

impl Value {
    pub fn new(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > VALUE_SIZE {
            return Err(anyhow!(
                "value must be at most {VALUE_SIZE} bytes, but got {}",
                bytes.len()
            ));
        }
        let mut value = [0u8; VALUE_SIZE];
        value[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(value))
    }

    /// The stored bytes without the trailing zero padding. Zero bytes at the end of the
    /// original input are indistinguishable from the padding and are dropped too.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.0[..len]
    }

    pub fn raw(&self) -> &[u8; VALUE_SIZE] {
        &self.0
    }

    fn from_raw(buff: &[u8]) -> Self {
        let mut value = [0u8; VALUE_SIZE];
        value.copy_from_slice(&buff[..VALUE_SIZE]);
        Self(value)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub(crate) key: i64,
    pub(crate) value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: i64,
    pub(crate) child: PageId,
}

/// Table-wide bookkeeping stored at the beginning of page 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HeaderPage {
    pub(crate) free_list: PageId,
    pub(crate) root: PageId,
    pub(crate) page_count: u64,
}

impl HeaderPage {
    pub(crate) fn initial() -> Self {
        Self {
            free_list: FREE_LIST_HEAD,
            root: INITIAL_ROOT,
            page_count: INITIAL_PAGE_COUNT,
        }
    }

    pub(crate) fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        let Some(free_list) = decode_pgid(&buff[HEADER_FREE_LIST_RANGE])? else {
            return Err(anyhow!("found an empty free list field when decoding header page"));
        };
        let Some(root) = decode_pgid(&buff[HEADER_ROOT_RANGE])? else {
            return Err(anyhow!("found an empty root field when decoding header page"));
        };
        let page_count = buff[HEADER_PAGE_COUNT_RANGE].read_le_u64();
        Ok(Self {
            free_list,
            root,
            page_count,
        })
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        buff[HEADER_FREE_LIST_RANGE].copy_from_slice(&self.free_list.to_le_offset());
        buff[HEADER_ROOT_RANGE].copy_from_slice(&self.root.to_le_offset());
        buff[HEADER_PAGE_COUNT_RANGE].copy_from_slice(&self.page_count.to_le_bytes());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeafNode {
    pub(crate) parent: Option<PageId>,
    pub(crate) records: Vec<Record>,
    pub(crate) next: Option<PageId>,
}

impl LeafNode {
    pub(crate) fn empty() -> Self {
        Self {
            parent: None,
            records: Vec::with_capacity(RECORD_ORDER),
            next: None,
        }
    }

    pub(crate) fn position(&self, key: i64) -> Result<usize, usize> {
        self.records.binary_search_by_key(&key, |record| record.key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InternalNode {
    pub(crate) parent: Option<PageId>,
    pub(crate) leftmost: PageId,
    pub(crate) entries: Vec<Entry>,
}

impl InternalNode {
    /// The subtree that may contain `key`: the child of the greatest separator that is not
    /// greater than `key`, or the leftmost child when every separator is greater.
    pub(crate) fn child_for(&self, key: i64) -> PageId {
        let i = self.entries.partition_point(|entry| entry.key <= key);
        if i == 0 {
            self.leftmost
        } else {
            self.entries[i - 1].child
        }
    }

    /// Position of `child` among the children: 0 is the leftmost child, `i + 1` is the child
    /// of `entries[i]`.
    pub(crate) fn child_position(&self, child: PageId) -> Option<usize> {
        if self.leftmost == child {
            return Some(0);
        }
        self.entries
            .iter()
            .position(|entry| entry.child == child)
            .map(|i| i + 1)
    }

    pub(crate) fn child_at(&self, position: usize) -> PageId {
        if position == 0 {
            self.leftmost
        } else {
            self.entries[position - 1].child
        }
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        std::iter::once(self.leftmost).chain(self.entries.iter().map(|entry| entry.child))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub(crate) fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        assert_eq!(PAGE_SIZE, buff.len());

        let parent = decode_pgid(&buff[PAGE_HEADER_LINK_RANGE])?;
        let is_leaf = buff[PAGE_HEADER_IS_LEAF_RANGE].read_le_i32();
        let count = buff[PAGE_HEADER_COUNT_RANGE].read_le_i32();
        let sibling = decode_pgid(&buff[PAGE_HEADER_SIBLING_RANGE])?;
        if count < 0 {
            return Err(anyhow!("page has a negative key count {count}"));
        }
        let count = count as usize;

        match is_leaf {
            1 => {
                if count > RECORD_PER_PAGE {
                    return Err(anyhow!(
                        "leaf page holds {count} records, but capacity is {RECORD_PER_PAGE}"
                    ));
                }
                let mut records = Vec::with_capacity(RECORD_ORDER);
                for i in 0..count {
                    let offset = PAGE_HEADER_SIZE + i * RECORD_SIZE;
                    let cell = &buff[offset..offset + RECORD_SIZE];
                    records.push(Record {
                        key: cell[RECORD_KEY_RANGE].read_le_i64(),
                        value: Value::from_raw(&cell[RECORD_VALUE_RANGE]),
                    });
                }
                Ok(Node::Leaf(LeafNode {
                    parent,
                    records,
                    next: sibling,
                }))
            }
            0 => {
                if count > ENTRY_PER_PAGE {
                    return Err(anyhow!(
                        "internal page holds {count} entries, but capacity is {ENTRY_PER_PAGE}"
                    ));
                }
                let Some(leftmost) = sibling else {
                    return Err(anyhow!("got zero leftmost child on internal page"));
                };
                let mut entries = Vec::with_capacity(ENTRY_ORDER);
                for i in 0..count {
                    let offset = PAGE_HEADER_SIZE + i * ENTRY_SIZE;
                    let cell = &buff[offset..offset + ENTRY_SIZE];
                    let Some(child) = decode_pgid(&cell[ENTRY_CHILD_RANGE])? else {
                        return Err(anyhow!("got zero child on internal page entry={i}"));
                    };
                    entries.push(Entry {
                        key: cell[ENTRY_KEY_RANGE].read_le_i64(),
                        child,
                    });
                }
                Ok(Node::Internal(InternalNode {
                    parent,
                    leftmost,
                    entries,
                }))
            }
            _ => Err(anyhow!("page kind {is_leaf} is not recognized")),
        }
    }

    pub(crate) fn encode(&self, buff: &mut [u8]) {
        assert_eq!(PAGE_SIZE, buff.len());
        buff.fill(0);

        match self {
            Node::Leaf(leaf) => {
                assert!(leaf.records.len() <= RECORD_PER_PAGE);
                buff[PAGE_HEADER_LINK_RANGE].copy_from_slice(&leaf.parent.to_le_offset());
                buff[PAGE_HEADER_IS_LEAF_RANGE].copy_from_slice(&1i32.to_le_bytes());
                buff[PAGE_HEADER_COUNT_RANGE]
                    .copy_from_slice(&(leaf.records.len() as i32).to_le_bytes());
                buff[PAGE_HEADER_SIBLING_RANGE].copy_from_slice(&leaf.next.to_le_offset());
                for (i, record) in leaf.records.iter().enumerate() {
                    let offset = PAGE_HEADER_SIZE + i * RECORD_SIZE;
                    let cell = &mut buff[offset..offset + RECORD_SIZE];
                    cell[RECORD_KEY_RANGE].copy_from_slice(&record.key.to_le_bytes());
                    cell[RECORD_VALUE_RANGE].copy_from_slice(record.value.raw());
                }
            }
            Node::Internal(node) => {
                assert!(node.entries.len() <= ENTRY_PER_PAGE);
                buff[PAGE_HEADER_LINK_RANGE].copy_from_slice(&node.parent.to_le_offset());
                buff[PAGE_HEADER_COUNT_RANGE]
                    .copy_from_slice(&(node.entries.len() as i32).to_le_bytes());
                buff[PAGE_HEADER_SIBLING_RANGE].copy_from_slice(&node.leftmost.to_le_offset());
                for (i, entry) in node.entries.iter().enumerate() {
                    let offset = PAGE_HEADER_SIZE + i * ENTRY_SIZE;
                    let cell = &mut buff[offset..offset + ENTRY_SIZE];
                    cell[ENTRY_KEY_RANGE].copy_from_slice(&entry.key.to_le_bytes());
                    cell[ENTRY_CHILD_RANGE].copy_from_slice(&entry.child.to_le_offset());
                }
            }
        }
    }

    pub(crate) fn parent(&self) -> Option<PageId> {
        match self {
            Node::Leaf(leaf) => leaf.parent,
            Node::Internal(node) => node.parent,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.records.len(),
            Node::Internal(node) => node.entries.len(),
        }
    }

    /// Minimum occupancy of a non-root page of this kind.
    pub(crate) fn min_len(&self) -> usize {
        match self {
            Node::Leaf(_) => cut(RECORD_ORDER - 1),
            Node::Internal(_) => cut(ENTRY_ORDER - 1),
        }
    }

    pub(crate) fn into_internal(self) -> InternalNode {
        match self {
            Node::Internal(node) => node,
            Node::Leaf(_) => panic!("expected an internal page, but got a leaf page"),
        }
    }
}

/// Reads the parent-or-free-link field of any page.
pub(crate) fn read_link(buff: &[u8]) -> anyhow::Result<Option<PageId>> {
    decode_pgid(&buff[PAGE_HEADER_LINK_RANGE])
}

/// Overwrites only the parent-or-free-link field, leaving the rest of the page intact.
pub(crate) fn write_link(buff: &mut [u8], link: Option<PageId>) {
    buff[PAGE_HEADER_LINK_RANGE].copy_from_slice(&link.to_le_offset());
}

/// Turns the page into a free page pointing at `next`.
pub(crate) fn init_free(buff: &mut [u8], next: Option<PageId>) {
    buff.fill(0);
    write_link(buff, next);
}

/// Layout of a page that was just handed out by the allocator: empty, but marked as in use so
/// that it can never be mistaken for a free page.
pub(crate) fn init_in_use(buff: &mut [u8]) {
    buff.fill(0);
    buff[PAGE_HEADER_IS_LEAF_RANGE].copy_from_slice(&1i32.to_le_bytes());
}

/// A page is laid out as a free page when nothing but its link field is set.
pub(crate) fn is_free_layout(buff: &[u8]) -> bool {
    buff[PAGE_HEADER_LINK_RANGE.end..].iter().all(|b| *b == 0)
}

fn decode_pgid(buff: &[u8]) -> anyhow::Result<Option<PageId>> {
    let offset = buff.read_le_u64();
    if offset % PAGE_SIZE as u64 != 0 {
        return Err(anyhow!("page offset {offset} is not aligned to the page size"));
    }
    Ok(PageId::from_offset(offset))
}
