mod buffer;
mod evictor;
mod file_manager;
mod page;

pub(crate) use crate::pager::buffer::BufferPool;
pub use crate::pager::page::{Value, VALUE_SIZE};
pub(crate) use crate::pager::page::{
    cut, init_free, init_in_use, is_free_layout, read_link, write_link, Entry, HeaderPage,
    InternalNode, LeafNode, Node, Record, ENTRY_ORDER, ENTRY_PER_PAGE, FREE_LIST_HEAD,
    HEADER_PAGE, INITIAL_PAGE_COUNT, INITIAL_ROOT, PAGE_SIZE, RECORD_ORDER, RECORD_PER_PAGE,
};
