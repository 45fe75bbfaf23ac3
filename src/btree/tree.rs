//! # Tree Algorithms
//!
//! Copy-on-write B+tree operations over the page-store capability traits.
//!
//! ## Descent
//!
//! Every operation descends from the root by `lookup_le`: at each internal
//! node, follow the child whose separator is the greatest key `<=` the
//! search key. The leftmost leaf carries a zero-length sentinel key at
//! index 0, so the lookup is total for any user key and the descent can
//! never fall off the left edge.
//!
//! ## Insert
//!
//! Mutation happens on the way back up. The touched leaf is rebuilt into a
//! two-page scratch buffer (one oversized insert always fits), then cut to
//! 1-3 page-sized pieces by `node_split3`. Each internal ancestor splices
//! the pieces in place of the old child entry, itself a rewrite into
//! scratch, split the same way. Replaced pages are released to the free
//! list; if the root splits, a new internal root is built over the pieces
//! and the tree grows by one level.
//!
//! ## Delete
//!
//! A miss is free: `tree_delete` propagates `None` and the tree is not
//! rewritten. On a hit, the leaf is rebuilt without the entry. A rewritten
//! child whose size drops below a quarter page is folded into its left
//! sibling when the merge fits one page, else its right sibling, else left
//! alone; merging replaces two parent entries with one. When the root ends
//! up internal with a single key, its lone child becomes the new root and
//! the height shrinks.
//!
//! Splicing a rewritten child can also grow a parent past the page bound
//! (the child's first key, and with it the parent separator, may get
//! longer), so the delete path runs every rewritten node through the same
//! splitter as inserts before splicing it in.

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use super::node::{
    leaf_delete, leaf_insert, leaf_update, node_merge, node_replace_2kid, Node, NodeBuf, NodeType,
};
use super::{PageAlloc, PageRead, MAX_KEY_SIZE, MAX_VAL_SIZE};
use crate::storage::PAGE_SIZE;

type SplitNodes = SmallVec<[NodeBuf; 3]>;

/// The ordered index. Holds only the root page number; all page access
/// goes through the store capability passed to each call.
#[derive(Debug)]
pub struct BTree {
    root: u64,
}

impl BTree {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn set_root(&mut self, root: u64) {
        self.root = root;
    }

    /// Point lookup. Read-only: no page or root changes, ever.
    pub fn get<S: PageRead>(&self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.root == 0 {
            return Ok(None);
        }

        let mut pn = self.root;
        loop {
            let node = Node::new(store.page(pn)?);
            let idx = node.lookup_le(key);
            match node.node_type()? {
                NodeType::Leaf => {
                    if node.key(idx) == key {
                        return Ok(Some(node.val(idx).to_vec()));
                    }
                    return Ok(None);
                }
                NodeType::Internal => {
                    pn = node.ptr(idx);
                    ensure!(pn != 0, "internal node with nil child");
                }
            }
        }
    }

    /// Inserts or updates one key.
    pub fn insert<S: PageAlloc>(&mut self, store: &mut S, key: &[u8], val: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), "empty key");
        ensure!(key.len() <= MAX_KEY_SIZE, "key too large: {}", key.len());
        ensure!(val.len() <= MAX_VAL_SIZE, "value too large: {}", val.len());

        if self.root == 0 {
            // first leaf: the sentinel occupies index 0 so lookups are total
            let mut root = NodeBuf::new(1);
            root.set_header(NodeType::Leaf, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, val);
            self.root = store.create(root.page())?;
            return Ok(());
        }

        let old_root = NodeBuf::from_page(store.page(self.root)?);
        let updated = tree_insert(store, &old_root, key, val)?;
        store.release(self.root)?;
        self.root = attach_root(store, node_split3(updated)?)?;
        Ok(())
    }

    /// Removes one key; returns whether it existed. A miss rewrites
    /// nothing.
    pub fn delete<S: PageAlloc>(&mut self, store: &mut S, key: &[u8]) -> Result<bool> {
        ensure!(!key.is_empty(), "empty key");

        if self.root == 0 {
            return Ok(false);
        }

        let old_root = NodeBuf::from_page(store.page(self.root)?);
        let Some(updated) = tree_delete(store, &old_root, key)? else {
            return Ok(false);
        };
        store.release(self.root)?;

        let node = updated.as_node();
        if node.node_type()? == NodeType::Internal && node.nkeys() == 1 {
            // the root holds a single child; drop a level
            self.root = node.ptr(0);
        } else {
            self.root = attach_root(store, node_split3(updated)?)?;
        }
        Ok(true)
    }
}

/// Persists split pieces and returns the new root page: the single piece
/// itself, or a fresh internal root over several.
fn attach_root<S: PageAlloc>(store: &mut S, pieces: SplitNodes) -> Result<u64> {
    if pieces.len() == 1 {
        return store.create(pieces[0].page());
    }

    let mut root = NodeBuf::new(1);
    root.set_header(NodeType::Internal, pieces.len() as u16);
    for (i, piece) in pieces.iter().enumerate() {
        let pn = store.create(piece.page())?;
        root.append_kv(i as u16, pn, piece.as_node().key(0), b"");
    }
    store.create(root.page())
}

/// Rewrites `node` with `key` inserted or updated. The result lives in
/// scratch and may exceed one page; the caller splits it.
fn tree_insert<S: PageAlloc>(
    store: &mut S,
    node: &NodeBuf,
    key: &[u8],
    val: &[u8],
) -> Result<NodeBuf> {
    let mut new = NodeBuf::new(2);
    let node = node.as_node();
    let idx = node.lookup_le(key);

    match node.node_type()? {
        NodeType::Leaf => {
            if node.key(idx) == key {
                leaf_update(&mut new, &node, idx, key, val);
            } else {
                leaf_insert(&mut new, &node, idx + 1, key, val);
            }
        }
        NodeType::Internal => {
            let kptr = node.ptr(idx);
            let child = NodeBuf::from_page(store.page(kptr)?);
            let updated = tree_insert(store, &child, key, val)?;
            let pieces = node_split3(updated)?;
            store.release(kptr)?;
            node_replace_kid_n(store, &mut new, &node, idx, pieces)?;
        }
    }
    Ok(new)
}

/// Rewrites `node` with `key` removed, or returns `None` when the key is
/// absent anywhere below it.
fn tree_delete<S: PageAlloc>(store: &mut S, node: &NodeBuf, key: &[u8]) -> Result<Option<NodeBuf>> {
    let node = node.as_node();
    let idx = node.lookup_le(key);

    match node.node_type()? {
        NodeType::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut new = NodeBuf::new(1);
            leaf_delete(&mut new, &node, idx);
            Ok(Some(new))
        }
        NodeType::Internal => node_delete(store, &node, idx, key),
    }
}

/// Delete recursion step for an internal node: rewrite child `idx`, then
/// either fold the shrunken child into a sibling or splice its replacement
/// pieces back in.
fn node_delete<S: PageAlloc>(
    store: &mut S,
    node: &Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<NodeBuf>> {
    let kptr = node.ptr(idx);
    let child = NodeBuf::from_page(store.page(kptr)?);
    let Some(updated) = tree_delete(store, &child, key)? else {
        return Ok(None);
    };
    store.release(kptr)?;

    let mut new = NodeBuf::new(2);
    match pick_sibling(store, node, idx, &updated)? {
        Sibling::Left(sibling) => {
            let mut merged = NodeBuf::new(1);
            node_merge(&mut merged, &sibling.as_node(), &updated.as_node());
            store.release(node.ptr(idx - 1))?;
            let pn = store.create(merged.page())?;
            node_replace_2kid(&mut new, node, idx - 1, pn, merged.as_node().key(0));
        }
        Sibling::Right(sibling) => {
            let mut merged = NodeBuf::new(1);
            node_merge(&mut merged, &updated.as_node(), &sibling.as_node());
            store.release(node.ptr(idx + 1))?;
            let pn = store.create(merged.page())?;
            node_replace_2kid(&mut new, node, idx, pn, merged.as_node().key(0));
        }
        Sibling::None if updated.nkeys() == 0 => {
            // the child emptied out with no sibling to fold into; only the
            // lone child of a single-key parent can get here
            assert!(node.nkeys() == 1 && idx == 0);
            new.set_header(NodeType::Internal, 0);
        }
        Sibling::None => {
            let pieces = node_split3(updated)?;
            node_replace_kid_n(store, &mut new, node, idx, pieces)?;
        }
    }
    Ok(Some(new))
}

enum Sibling {
    None,
    Left(NodeBuf),
    Right(NodeBuf),
}

/// Merge policy: a rewritten child below a quarter page folds into the
/// left sibling when the result fits a page, else the right, else stays.
fn pick_sibling<S: PageRead>(
    store: &S,
    parent: &Node,
    idx: u16,
    updated: &NodeBuf,
) -> Result<Sibling> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(Sibling::None);
    }

    if idx > 0 {
        let sibling = NodeBuf::from_page(store.page(parent.ptr(idx - 1))?);
        if sibling.nbytes() + updated.nbytes() - super::NODE_HEADER <= PAGE_SIZE {
            return Ok(Sibling::Left(sibling));
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = NodeBuf::from_page(store.page(parent.ptr(idx + 1))?);
        if sibling.nbytes() + updated.nbytes() - super::NODE_HEADER <= PAGE_SIZE {
            return Ok(Sibling::Right(sibling));
        }
    }
    Ok(Sibling::None)
}

/// New internal node = `old` with the child entry at `idx` replaced by
/// `kids`, each persisted and keyed by its first key.
fn node_replace_kid_n<S: PageAlloc>(
    store: &mut S,
    new: &mut NodeBuf,
    old: &Node,
    idx: u16,
    kids: SplitNodes,
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.iter().enumerate() {
        let pn = store.create(kid.page())?;
        new.append_kv(idx + i as u16, pn, kid.as_node().key(0), b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - idx - 1);
    Ok(())
}

/// Cuts a scratch node into two pieces: the right half must fit a page,
/// and among split points where the left fits too, the most balanced wins.
/// An oversized left is the caller's problem (it re-splits).
fn node_split2(left: &mut NodeBuf, right: &mut NodeBuf, old: &Node) -> Result<()> {
    let n = old.nkeys();
    assert!(n >= 2, "split of a {}-key node", n);
    let btype = old.node_type()?;

    let mut best: Option<(u16, usize)> = None;
    let mut fallback: Option<u16> = None;
    for i in 1..n {
        let left_size = old.size_for(0, i);
        let right_size = old.size_for(i, n - i);
        if right_size > PAGE_SIZE {
            continue;
        }
        if fallback.is_none() {
            fallback = Some(i);
        }
        if left_size <= PAGE_SIZE {
            let larger = left_size.max(right_size);
            if best.map_or(true, |(_, b)| larger < b) {
                best = Some((i, larger));
            }
        }
    }
    let Some(idx) = best.map(|(i, _)| i).or(fallback) else {
        bail!("unsplittable node: {} keys, {} bytes", n, old.nbytes());
    };

    left.set_header(btype, idx);
    right.set_header(btype, n - idx);
    left.append_range(old, 0, 0, idx);
    right.append_range(old, 0, idx, n - idx);
    Ok(())
}

/// Cuts a scratch node into 1-3 page-sized pieces, preserving key order.
fn node_split3(old: NodeBuf) -> Result<SplitNodes> {
    if old.nbytes() <= PAGE_SIZE {
        return Ok(smallvec![old]);
    }

    let mut left = NodeBuf::new(2);
    let mut right = NodeBuf::new(1);
    node_split2(&mut left, &mut right, &old.as_node())?;
    if left.nbytes() <= PAGE_SIZE {
        return Ok(smallvec![left, right]);
    }

    let mut leftleft = NodeBuf::new(2);
    let mut middle = NodeBuf::new(1);
    node_split2(&mut leftleft, &mut middle, &left.as_node())?;
    ensure!(
        leftleft.nbytes() <= PAGE_SIZE,
        "three-way split left oversized: {} bytes",
        leftleft.nbytes()
    );
    Ok(smallvec![leftleft, middle, right])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::{HashMap, HashSet};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    /// Page store over a plain map: `create` assigns fresh numbers,
    /// `release` drops the page immediately. Because released pages vanish,
    /// any dangling reference or leaked page shows up in the invariant
    /// walk.
    struct MemStore {
        pages: HashMap<u64, Box<[u8]>>,
        next: u64,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                next: 1,
            }
        }
    }

    impl PageRead for MemStore {
        fn page(&self, pn: u64) -> Result<&[u8]> {
            match self.pages.get(&pn) {
                Some(page) => Ok(page),
                None => bail!("no such page {}", pn),
            }
        }
    }

    impl PageAlloc for MemStore {
        fn create(&mut self, page: &[u8]) -> Result<u64> {
            assert_eq!(page.len(), PAGE_SIZE);
            let pn = self.next;
            self.next += 1;
            self.pages.insert(pn, page.into());
            Ok(pn)
        }

        fn release(&mut self, pn: u64) -> Result<()> {
            ensure!(self.pages.remove(&pn).is_some(), "double release of {}", pn);
            Ok(())
        }
    }

    /// Walks the whole tree checking the structural invariants: node sizes,
    /// per-node key order, parent separators, and that the reachable page
    /// set is exactly the allocated page set (no leaks, no dangling).
    fn check_invariants(store: &MemStore, tree: &BTree) {
        let mut reachable = HashSet::new();
        if tree.root() != 0 {
            walk(store, tree.root(), &mut reachable);
        }
        let allocated: HashSet<u64> = store.pages.keys().copied().collect();
        assert_eq!(reachable, allocated, "leaked or dangling pages");
    }

    fn walk(store: &MemStore, pn: u64, seen: &mut HashSet<u64>) {
        assert!(seen.insert(pn), "page {} reachable twice", pn);
        let node = Node::new(store.page(pn).unwrap());
        let node_type = node.node_type().unwrap();

        assert!(node.nbytes() <= PAGE_SIZE, "page {} oversized", pn);
        for i in 1..node.nkeys() {
            assert!(node.key(i - 1) < node.key(i), "page {} out of order", pn);
        }

        if node_type == NodeType::Internal {
            assert!(node.nkeys() > 0);
            for i in 0..node.nkeys() {
                let child = Node::new(store.page(node.ptr(i)).unwrap());
                assert_eq!(
                    child.key(0),
                    node.key(i),
                    "separator mismatch under page {}",
                    pn
                );
                walk(store, node.ptr(i), seen);
            }
        }
    }

    fn new_tree() -> (MemStore, BTree) {
        (MemStore::new(), BTree::new(0))
    }

    #[test]
    fn get_on_empty_tree_is_none() {
        let (store, tree) = new_tree();

        assert_eq!(tree.get(&store, b"missing").unwrap(), None);
    }

    #[test]
    fn insert_then_get_single_key() {
        let (mut store, mut tree) = new_tree();

        tree.insert(&mut store, b"hello", b"world").unwrap();

        assert_eq!(tree.get(&store, b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tree.get(&store, b"other").unwrap(), None);
        check_invariants(&store, &tree);
    }

    #[test]
    fn insert_overwrites_existing_value() {
        let (mut store, mut tree) = new_tree();

        tree.insert(&mut store, b"key", b"v1").unwrap();
        tree.insert(&mut store, b"key", b"v2").unwrap();

        assert_eq!(tree.get(&store, b"key").unwrap(), Some(b"v2".to_vec()));
        check_invariants(&store, &tree);
    }

    #[test]
    fn insert_rejects_oversized_and_empty_keys() {
        let (mut store, mut tree) = new_tree();

        assert!(tree.insert(&mut store, b"", b"v").is_err());
        assert!(tree.insert(&mut store, &[0u8; 1001], b"v").is_err());
        assert!(tree.insert(&mut store, b"k", &vec![0u8; 3001]).is_err());
        assert_eq!(tree.root(), 0);
    }

    #[test]
    fn delete_rejects_empty_key_and_keeps_the_sentinel() {
        let (mut store, mut tree) = new_tree();
        tree.insert(&mut store, b"a", b"1").unwrap();

        assert!(tree.delete(&mut store, b"").is_err());

        // the sentinel at index 0 must survive; an empty key would have
        // matched it in the leaf and deleted it
        let root = Node::new(store.page(tree.root()).unwrap());
        assert_eq!(root.nkeys(), 2);
        assert_eq!(root.key(0), b"");
        assert_eq!(tree.get(&store, b"a").unwrap(), Some(b"1".to_vec()));
        check_invariants(&store, &tree);
    }

    #[test]
    fn thousand_inserts_stay_sorted_and_page_bounded() {
        let (mut store, mut tree) = new_tree();

        for i in 0..1000 {
            let key = format!("key_{:04}", i);
            let val = format!("value_{:04}", i);
            tree.insert(&mut store, key.as_bytes(), val.as_bytes())
                .unwrap();
        }
        check_invariants(&store, &tree);

        assert_eq!(
            tree.get(&store, b"key_0500").unwrap(),
            Some(b"value_0500".to_vec())
        );
        for i in (0..1000).step_by(97) {
            let key = format!("key_{:04}", i);
            let val = format!("value_{:04}", i);
            assert_eq!(
                tree.get(&store, key.as_bytes()).unwrap(),
                Some(val.into_bytes())
            );
        }
    }

    #[test]
    fn reverse_order_inserts_match_reference() {
        let (mut store, mut tree) = new_tree();
        let mut reference = std::collections::BTreeMap::new();

        for i in (0..300).rev() {
            let key = format!("k{:05}", i).into_bytes();
            let val = format!("v{:05}", i).into_bytes();
            tree.insert(&mut store, &key, &val).unwrap();
            reference.insert(key, val);
        }
        check_invariants(&store, &tree);

        for (key, val) in &reference {
            assert_eq!(tree.get(&store, key).unwrap(), Some(val.clone()));
        }
    }

    #[test]
    fn delete_missing_key_leaves_pages_untouched() {
        let (mut store, mut tree) = new_tree();
        tree.insert(&mut store, b"a", b"1").unwrap();
        let pages_before: Vec<u64> = store.pages.keys().copied().collect();
        let root_before = tree.root();

        assert!(!tree.delete(&mut store, b"zz").unwrap());

        let pages_after: Vec<u64> = store.pages.keys().copied().collect();
        assert_eq!(pages_before, pages_after);
        assert_eq!(tree.root(), root_before);
    }

    #[test]
    fn delete_existing_key_removes_it() {
        let (mut store, mut tree) = new_tree();
        tree.insert(&mut store, b"a", b"1").unwrap();
        tree.insert(&mut store, b"b", b"2").unwrap();

        assert!(tree.delete(&mut store, b"a").unwrap());

        assert_eq!(tree.get(&store, b"a").unwrap(), None);
        assert_eq!(tree.get(&store, b"b").unwrap(), Some(b"2".to_vec()));
        check_invariants(&store, &tree);
    }

    #[test]
    fn random_deletes_keep_invariants() {
        let (mut store, mut tree) = new_tree();
        let mut reference = std::collections::BTreeMap::new();

        for i in 0..200 {
            let key = format!("key_{:04}", i).into_bytes();
            let val = format!("val_{:04}", i).into_bytes();
            tree.insert(&mut store, &key, &val).unwrap();
            reference.insert(key, val);
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut doomed: Vec<Vec<u8>> = reference.keys().cloned().collect();
        doomed.shuffle(&mut rng);
        doomed.truncate(100);

        for key in &doomed {
            assert!(tree.delete(&mut store, key).unwrap(), "missing {:?}", key);
            reference.remove(key);
            check_invariants(&store, &tree);
        }

        for (key, val) in &reference {
            assert_eq!(tree.get(&store, key).unwrap(), Some(val.clone()));
        }
        for key in &doomed {
            assert_eq!(tree.get(&store, key).unwrap(), None);
        }
    }

    #[test]
    fn delete_everything_shrinks_back_to_a_leaf() {
        let (mut store, mut tree) = new_tree();

        for i in 0..500 {
            let key = format!("key_{:04}", i);
            tree.insert(&mut store, key.as_bytes(), b"x").unwrap();
        }
        for i in 0..500 {
            let key = format!("key_{:04}", i);
            assert!(tree.delete(&mut store, key.as_bytes()).unwrap());
        }
        check_invariants(&store, &tree);

        // only the sentinel leaf remains
        let root = Node::new(store.page(tree.root()).unwrap());
        assert_eq!(root.node_type().unwrap(), NodeType::Leaf);
        assert_eq!(root.nkeys(), 1);
        assert_eq!(root.key(0), b"");
    }

    #[test]
    fn maximal_pairs_split_every_insert() {
        let (mut store, mut tree) = new_tree();

        // leaf capacity is one maximal pair, so every insert after the
        // first forces a split
        for i in 0..11u8 {
            let mut key = vec![b'k'; 990];
            key[0] = b'a' + i;
            let val = vec![b'v'; 2990];
            tree.insert(&mut store, &key, &val).unwrap();
            check_invariants(&store, &tree);
        }

        assert!(store.pages.len() > 11);
        let mut key = vec![b'k'; 990];
        key[0] = b'a' + 5;
        assert_eq!(tree.get(&store, &key).unwrap(), Some(vec![b'v'; 2990]));
    }

    #[test]
    fn mixed_workload_matches_reference_model() {
        let (mut store, mut tree) = new_tree();
        let mut reference = std::collections::BTreeMap::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let mut keys: Vec<u32> = (0..400).collect();
        keys.shuffle(&mut rng);

        for (step, k) in keys.iter().enumerate() {
            let key = format!("user:{:06}", k).into_bytes();
            if step % 3 == 2 {
                let existed = tree.delete(&mut store, &key).unwrap();
                assert_eq!(existed, reference.remove(&key).is_some());
            } else {
                let val = format!("payload-{}", step).into_bytes();
                tree.insert(&mut store, &key, &val).unwrap();
                reference.insert(key, val);
            }
        }
        check_invariants(&store, &tree);

        for (key, val) in &reference {
            assert_eq!(tree.get(&store, key).unwrap(), Some(val.clone()));
        }
    }
}
