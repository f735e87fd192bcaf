use crate::id::PageId;
use crate::pager::{
    cut, is_free_layout, read_link, write_link, Entry, InternalNode, LeafNode, Node, Record,
    Value, ENTRY_ORDER, ENTRY_PER_PAGE, FREE_LIST_HEAD, HEADER_PAGE, RECORD_ORDER, RECORD_PER_PAGE,
};
use crate::table::TableIo;
use anyhow::anyhow;

/// B+tree over the pages of one table. The root page is recorded in the table header; every
/// node is decoded from its page on access and written back right after it changes.
pub(crate) struct BTree<'a> {
    io: TableIo<'a>,
}

impl<'a> BTree<'a> {
    pub(crate) fn new(io: TableIo<'a>) -> Self {
        Self { io }
    }

    fn root(&self) -> PageId {
        self.io.header().root
    }

    /// Descends from the root to the leaf that holds, or would hold, `key`.
    pub(crate) fn find_leaf(&self, key: i64) -> anyhow::Result<(PageId, LeafNode)> {
        let mut pgid = self.root();
        loop {
            match self.io.load(pgid)? {
                Node::Leaf(leaf) => return Ok((pgid, leaf)),
                Node::Internal(node) => pgid = node.child_for(key),
            }
        }
    }

    pub(crate) fn get(&self, key: i64) -> anyhow::Result<Option<Value>> {
        let (_, leaf) = self.find_leaf(key)?;
        Ok(leaf
            .records
            .iter()
            .find(|record| record.key == key)
            .map(|record| record.value))
    }

    /// Returns false, without changing anything, when the key is already present.
    pub(crate) fn insert(&mut self, key: i64, value: Value) -> anyhow::Result<bool> {
        let (pgid, mut leaf) = self.find_leaf(key)?;
        let position = match leaf.position(key) {
            Ok(_) => return Ok(false),
            Err(position) => position,
        };

        let record = Record { key, value };
        if leaf.records.len() < RECORD_PER_PAGE {
            leaf.records.insert(position, record);
            self.io.store(pgid, &Node::Leaf(leaf))?;
        } else {
            self.split_leaf(pgid, leaf, position, record)?;
        }
        Ok(true)
    }

    fn split_leaf(
        &mut self,
        pgid: PageId,
        mut leaf: LeafNode,
        position: usize,
        record: Record,
    ) -> anyhow::Result<()> {
        let mut records = std::mem::take(&mut leaf.records);
        records.insert(position, record);
        assert_eq!(RECORD_ORDER, records.len());

        let split = cut(RECORD_ORDER - 1);
        let right_records = records.split_off(split);
        let new_pgid = self.io.alloc_page()?;
        let new_leaf = LeafNode {
            parent: leaf.parent,
            records: right_records,
            next: leaf.next,
        };
        leaf.records = records;
        leaf.next = Some(new_pgid);

        let k_prime = new_leaf.records[0].key;
        let parent = leaf.parent;
        self.io.store(pgid, &Node::Leaf(leaf))?;
        self.io.store(new_pgid, &Node::Leaf(new_leaf))?;
        log::debug!("split leaf {pgid:?} into {new_pgid:?} at key {k_prime}");

        self.insert_into_parent(pgid, parent, k_prime, new_pgid)
    }

    /// Links `right`, the new sibling created by splitting `left`, into the parent of `left`.
    fn insert_into_parent(
        &mut self,
        left: PageId,
        parent: Option<PageId>,
        k_prime: i64,
        right: PageId,
    ) -> anyhow::Result<()> {
        let Some(parent_pgid) = parent else {
            return self.insert_into_new_root(left, k_prime, right);
        };

        let mut parent = self.io.load(parent_pgid)?.into_internal();
        let Some(position) = parent.child_position(left) else {
            panic!("page {left:?} is not a child of its parent {parent_pgid:?}");
        };
        let entry = Entry {
            key: k_prime,
            child: right,
        };

        if parent.entries.len() < ENTRY_PER_PAGE {
            parent.entries.insert(position, entry);
            return self.io.store(parent_pgid, &Node::Internal(parent));
        }
        self.split_internal(parent_pgid, parent, position, entry)
    }

    fn insert_into_new_root(
        &mut self,
        left: PageId,
        k_prime: i64,
        right: PageId,
    ) -> anyhow::Result<()> {
        let root = self.io.alloc_page()?;
        let node = InternalNode {
            parent: None,
            leftmost: left,
            entries: vec![Entry {
                key: k_prime,
                child: right,
            }],
        };
        self.io.store(root, &Node::Internal(node))?;
        self.set_parent(left, Some(root))?;
        self.set_parent(right, Some(root))?;
        self.io.set_header(|header| header.root = root)?;
        log::debug!("new root {root:?} above {left:?} and {right:?}");
        Ok(())
    }

    fn split_internal(
        &mut self,
        pgid: PageId,
        mut node: InternalNode,
        position: usize,
        entry: Entry,
    ) -> anyhow::Result<()> {
        let mut entries = std::mem::take(&mut node.entries);
        entries.insert(position, entry);
        assert_eq!(ENTRY_ORDER, entries.len());

        // the left page keeps `split - 1` entries, the entry at `split - 1` moves up and its
        // child becomes the leftmost child of the new page
        let split = cut(entries.len());
        let right_entries = entries.split_off(split);
        let Some(middle) = entries.pop() else {
            unreachable!();
        };

        let new_pgid = self.io.alloc_page()?;
        let new_node = InternalNode {
            parent: node.parent,
            leftmost: middle.child,
            entries: right_entries,
        };
        node.entries = entries;

        let parent = node.parent;
        self.io.store(pgid, &Node::Internal(node))?;
        self.io.store(new_pgid, &Node::Internal(new_node.clone()))?;
        for child in new_node.children() {
            self.set_parent(child, Some(new_pgid))?;
        }
        log::debug!(
            "split internal {pgid:?} into {new_pgid:?} at key {}",
            middle.key
        );

        self.insert_into_parent(pgid, parent, middle.key, new_pgid)
    }

    fn set_parent(&mut self, pgid: PageId, parent: Option<PageId>) -> anyhow::Result<()> {
        self.io.write_page(pgid, |buff| write_link(buff, parent))
    }

    /// Returns false when the key is not present.
    pub(crate) fn delete(&mut self, key: i64) -> anyhow::Result<bool> {
        let (pgid, leaf) = self.find_leaf(key)?;
        if leaf.position(key).is_err() {
            return Ok(false);
        }
        self.delete_entry(pgid, Node::Leaf(leaf), key)?;
        Ok(true)
    }

    /// Removes `key` from the node stored at `pgid` and repairs the tree upwards.
    fn delete_entry(&mut self, pgid: PageId, mut node: Node, key: i64) -> anyhow::Result<()> {
        remove_key(&mut node, key);

        if pgid == self.root() {
            return self.adjust_root(pgid, node);
        }
        if node.len() >= node.min_len() {
            return self.io.store(pgid, &node);
        }

        let Some(parent_pgid) = node.parent() else {
            panic!("non-root page {pgid:?} has no parent");
        };
        let parent = self.io.load(parent_pgid)?.into_internal();
        let Some(position) = parent.child_position(pgid) else {
            panic!("page {pgid:?} is not a child of its parent {parent_pgid:?}");
        };

        // prefer the right sibling, the rightmost child borrows from its left sibling
        if position < parent.entries.len() {
            let neighbor_pgid = parent.child_at(position + 1);
            let neighbor = self.io.load(neighbor_pgid)?;
            self.rebalance(
                parent_pgid,
                parent,
                position,
                (pgid, node),
                (neighbor_pgid, neighbor),
                true,
            )
        } else {
            let neighbor_pgid = parent.child_at(position - 1);
            let neighbor = self.io.load(neighbor_pgid)?;
            self.rebalance(
                parent_pgid,
                parent,
                position - 1,
                (neighbor_pgid, neighbor),
                (pgid, node),
                false,
            )
        }
    }

    fn rebalance(
        &mut self,
        parent_pgid: PageId,
        parent: InternalNode,
        k_index: usize,
        left: (PageId, Node),
        right: (PageId, Node),
        deficient_left: bool,
    ) -> anyhow::Result<()> {
        let k_prime = parent.entries[k_index].key;
        let fits = match (&left.1, &right.1) {
            (Node::Leaf(l), Node::Leaf(r)) => l.records.len() + r.records.len() <= RECORD_PER_PAGE,
            (Node::Internal(l), Node::Internal(r)) => {
                l.entries.len() + r.entries.len() < ENTRY_PER_PAGE
            }
            _ => panic!(
                "siblings {:?} and {:?} are of different kinds",
                left.0, right.0
            ),
        };

        if fits {
            self.coalesce(left, right, k_prime)?;
            self.delete_entry(parent_pgid, Node::Internal(parent), k_prime)
        } else {
            self.redistribute(parent_pgid, parent, k_index, left, right, deficient_left)
        }
    }

    /// Moves everything from `right` into `left` and frees the right page.
    fn coalesce(
        &mut self,
        (left_pgid, left): (PageId, Node),
        (right_pgid, right): (PageId, Node),
        k_prime: i64,
    ) -> anyhow::Result<()> {
        let merged = match (left, right) {
            (Node::Leaf(mut l), Node::Leaf(r)) => {
                l.records.extend(r.records);
                l.next = r.next;
                Node::Leaf(l)
            }
            (Node::Internal(mut l), Node::Internal(r)) => {
                l.entries.push(Entry {
                    key: k_prime,
                    child: r.leftmost,
                });
                l.entries.extend(r.entries.iter().copied());
                for child in r.children() {
                    self.set_parent(child, Some(left_pgid))?;
                }
                Node::Internal(l)
            }
            _ => unreachable!(),
        };

        self.io.store(left_pgid, &merged)?;
        self.io.free_page(right_pgid)?;
        log::debug!("coalesce {right_pgid:?} into {left_pgid:?}");
        Ok(())
    }

    /// Moves a single item from the fuller sibling into the deficient one and rewrites the
    /// separator between them.
    fn redistribute(
        &mut self,
        parent_pgid: PageId,
        mut parent: InternalNode,
        k_index: usize,
        (left_pgid, mut left): (PageId, Node),
        (right_pgid, mut right): (PageId, Node),
        deficient_left: bool,
    ) -> anyhow::Result<()> {
        match (&mut left, &mut right) {
            (Node::Leaf(l), Node::Leaf(r)) => {
                if deficient_left {
                    let record = r.records.remove(0);
                    l.records.push(record);
                } else {
                    let Some(record) = l.records.pop() else {
                        unreachable!();
                    };
                    r.records.insert(0, record);
                }
                parent.entries[k_index].key = r.records[0].key;
            }
            (Node::Internal(l), Node::Internal(r)) => {
                let k_prime = parent.entries[k_index].key;
                if deficient_left {
                    let moved = r.leftmost;
                    l.entries.push(Entry {
                        key: k_prime,
                        child: moved,
                    });
                    let first = r.entries.remove(0);
                    r.leftmost = first.child;
                    parent.entries[k_index].key = first.key;
                    self.set_parent(moved, Some(left_pgid))?;
                } else {
                    let Some(last) = l.entries.pop() else {
                        unreachable!();
                    };
                    r.entries.insert(
                        0,
                        Entry {
                            key: k_prime,
                            child: r.leftmost,
                        },
                    );
                    r.leftmost = last.child;
                    parent.entries[k_index].key = last.key;
                    self.set_parent(last.child, Some(right_pgid))?;
                }
            }
            _ => unreachable!(),
        }

        self.io.store(left_pgid, &left)?;
        self.io.store(right_pgid, &right)?;
        self.io.store(parent_pgid, &Node::Internal(parent))?;
        log::debug!(
            "redistribute between {left_pgid:?} and {right_pgid:?}, deficient_left={deficient_left}"
        );
        Ok(())
    }

    /// The root may shrink down to an empty leaf. An internal root left without separators is
    /// replaced by its only child.
    fn adjust_root(&mut self, pgid: PageId, node: Node) -> anyhow::Result<()> {
        match node {
            Node::Internal(node) if node.entries.is_empty() => {
                let new_root = node.leftmost;
                self.set_parent(new_root, None)?;
                self.io.set_header(|header| header.root = new_root)?;
                self.io.free_page(pgid)?;
                log::debug!("root {pgid:?} collapsed into {new_root:?}");
                Ok(())
            }
            node => self.io.store(pgid, &node),
        }
    }

    fn leftmost_leaf(&self) -> anyhow::Result<PageId> {
        let mut pgid = self.root();
        loop {
            match self.io.load(pgid)? {
                Node::Leaf(_) => return Ok(pgid),
                Node::Internal(node) => pgid = node.leftmost,
            }
        }
    }

    /// All records in key order, read by following the leaf chain.
    pub(crate) fn scan(&self) -> anyhow::Result<Vec<(i64, Value)>> {
        let page_count = self.io.header().page_count;
        let mut result = Vec::new();
        let mut next = Some(self.leftmost_leaf()?);
        let mut visited = 0;
        while let Some(pgid) = next {
            visited += 1;
            if visited > page_count {
                return Err(anyhow!("leaf chain of {:?} has a cycle", self.io.id()));
            }
            let Node::Leaf(leaf) = self.io.load(pgid)? else {
                return Err(anyhow!("leaf chain reaches internal page {pgid:?}"));
            };
            result.extend(leaf.records.iter().map(|record| (record.key, record.value)));
            next = leaf.next;
        }
        Ok(result)
    }

    /// Checks the structure of the whole table and reports the first violation found.
    pub(crate) fn verify(&self) -> anyhow::Result<()> {
        let header = self.io.header();
        let mut ctx = VerifyContext {
            seen: vec![false; header.page_count as usize],
            leaves: Vec::new(),
            leaf_depth: None,
        };
        ctx.seen[HEADER_PAGE.get() as usize] = true;
        ctx.seen[FREE_LIST_HEAD.get() as usize] = true;
        self.verify_node(header.root, None, None, None, 0, &mut ctx)?;

        let mut chain = Vec::with_capacity(ctx.leaves.len());
        let mut next = Some(self.leftmost_leaf()?);
        while let Some(pgid) = next {
            if chain.len() >= ctx.leaves.len() {
                return Err(anyhow!("leaf chain is longer than the number of leaves"));
            }
            chain.push(pgid);
            let Node::Leaf(leaf) = self.io.load(pgid)? else {
                return Err(anyhow!("leaf chain reaches internal page {pgid:?}"));
            };
            next = leaf.next;
        }
        if chain != ctx.leaves {
            return Err(anyhow!(
                "leaf chain {chain:?} does not match the key order {:?}",
                ctx.leaves
            ));
        }

        let freelist = self.io.table.freelist;
        let mut link = self.io.read_page(FREE_LIST_HEAD, read_link)??;
        let mut count = 0;
        let mut last = FREE_LIST_HEAD;
        while let Some(pgid) = link {
            if pgid.get() >= header.page_count {
                return Err(anyhow!("free page {pgid:?} is out of bound"));
            }
            if ctx.seen[pgid.get() as usize] {
                return Err(anyhow!("free page {pgid:?} is also in use"));
            }
            ctx.seen[pgid.get() as usize] = true;
            if !self.io.read_page(pgid, is_free_layout)? {
                return Err(anyhow!("page {pgid:?} is in the free list but not empty"));
            }
            count += 1;
            last = pgid;
            link = self.io.read_page(pgid, read_link)??;
        }
        if count != freelist.capacity() {
            return Err(anyhow!(
                "free list has {count} pages, but capacity is {}",
                freelist.capacity()
            ));
        }
        if last != freelist.tail() {
            return Err(anyhow!(
                "free list ends at {last:?}, but tail is {:?}",
                freelist.tail()
            ));
        }

        if let Some(pgid) = ctx.seen.iter().position(|seen| !seen) {
            return Err(anyhow!(
                "page {pgid} is neither in the tree nor in the free list"
            ));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        pgid: PageId,
        parent: Option<PageId>,
        lower: Option<i64>,
        upper: Option<i64>,
        depth: usize,
        ctx: &mut VerifyContext,
    ) -> anyhow::Result<()> {
        let Some(seen) = ctx.seen.get_mut(pgid.get() as usize) else {
            return Err(anyhow!("page {pgid:?} is out of bound"));
        };
        if *seen {
            return Err(anyhow!("page {pgid:?} is referenced twice"));
        }
        *seen = true;

        let node = self.io.load(pgid)?;
        if node.parent() != parent {
            return Err(anyhow!(
                "page {pgid:?} points to parent {:?}, but is a child of {parent:?}",
                node.parent()
            ));
        }
        if parent.is_some() && node.len() < node.min_len() {
            return Err(anyhow!(
                "page {pgid:?} holds {} items, below the minimum of {}",
                node.len(),
                node.min_len()
            ));
        }

        let keys = match &node {
            Node::Leaf(leaf) => leaf.records.iter().map(|r| r.key).collect::<Vec<_>>(),
            Node::Internal(node) => node.entries.iter().map(|e| e.key).collect::<Vec<_>>(),
        };
        if !keys.windows(2).all(|w| w[0] < w[1]) {
            return Err(anyhow!("keys of page {pgid:?} are not sorted"));
        }
        if let (Some(lower), Some(first)) = (lower, keys.first()) {
            if *first < lower {
                return Err(anyhow!("key {first} of page {pgid:?} is below {lower}"));
            }
        }
        if let (Some(upper), Some(last)) = (upper, keys.last()) {
            if *last >= upper {
                return Err(anyhow!("key {last} of page {pgid:?} is not below {upper}"));
            }
        }

        match node {
            Node::Leaf(_) => {
                match ctx.leaf_depth {
                    Some(leaf_depth) if leaf_depth != depth => {
                        return Err(anyhow!(
                            "leaf {pgid:?} is at depth {depth}, other leaves are at {leaf_depth}"
                        ));
                    }
                    _ => ctx.leaf_depth = Some(depth),
                }
                ctx.leaves.push(pgid);
            }
            Node::Internal(node) => {
                if node.entries.is_empty() {
                    return Err(anyhow!("internal page {pgid:?} has no separator"));
                }
                for position in 0..=node.entries.len() {
                    let child_lower = if position == 0 {
                        lower
                    } else {
                        Some(node.entries[position - 1].key)
                    };
                    let child_upper = node.entries.get(position).map(|e| e.key).or(upper);
                    self.verify_node(
                        node.child_at(position),
                        Some(pgid),
                        child_lower,
                        child_upper,
                        depth + 1,
                        ctx,
                    )?;
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn height(&self) -> anyhow::Result<usize> {
        let mut height = 1;
        let mut pgid = self.root();
        while let Node::Internal(node) = self.io.load(pgid)? {
            height += 1;
            pgid = node.leftmost;
        }
        Ok(height)
    }
}

struct VerifyContext {
    seen: Vec<bool>,
    leaves: Vec<PageId>,
    leaf_depth: Option<usize>,
}

fn remove_key(node: &mut Node, key: i64) {
    match node {
        Node::Leaf(leaf) => {
            let Ok(i) = leaf.position(key) else {
                panic!("key {key} is not in the leaf");
            };
            leaf.records.remove(i);
        }
        Node::Internal(node) => {
            let Some(i) = node.entries.iter().position(|entry| entry.key == key) else {
                panic!("separator {key} is not in the internal page");
            };
            node.entries.remove(i);
        }
    }
}
