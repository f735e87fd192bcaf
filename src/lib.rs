mod bins;
mod btree;
mod catalog;
mod db;
mod freelist;
mod id;
mod pager;
mod recovery;
mod table;
mod wal;

#[cfg(test)]
mod test_utils;

pub use db::{Db, Setting};
pub use id::TableId;
pub use pager::{Value, VALUE_SIZE};
