//! The B-tree engine: root management, lookup, insert-or-replace with
//! split-at-descent, and in-order traversal.
//!
//! Every write path follows the same discipline: build new node images in
//! memory, allocate fresh offsets for them, write and barrier them, then
//! publish a single 8-byte pointer (the root pointer or a parent's child
//! slot) that makes the new structure reachable, barrier again, and only
//! then free whatever the pointer used to reference. A reader that opens
//! the file at any point along that sequence sees either the old tree or
//! the new one, never a mix.

use std::path::Path;
use std::rc::Rc;

use crate::allocator::Allocator;
use crate::codec::write_u64;
use crate::config::{HDR_MAGIC_POS, HDR_ROOTPTR_POS, MAGIC, MAX_KEYS};
use crate::device::{ByteDevice, OsFileDevice};
use crate::error::{Error, Result};
use crate::node::{Key, Node, CHILDREN_OFF, NODE_SIZE, VALUES_OFF};

/// Where to write a node's new offset once it has been built and flushed:
/// either the tree's root pointer, or a specific child slot of an
/// already-resolved parent node.
enum PointerRef {
    Root,
    Child { node_offset: u64, index: usize },
}

/// A handle on one open, durable B-tree file.
pub struct Tree {
    device: Rc<dyn ByteDevice>,
    allocator: Allocator,
    tag_gen: crate::node::TagGenerator,
    write_barrier: bool,
    root_offset: u64,
}

impl Tree {
    /// Lay out a brand new, empty tree at `path`, truncating any existing
    /// file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Tree> {
        let device: Rc<dyn ByteDevice> = Rc::new(OsFileDevice::create_or_open(path)?);
        device.resize(crate::config::HDR_SIZE)?;
        device.pwrite(MAGIC, HDR_MAGIC_POS)?;
        write_u64(&*device, crate::config::HDR_FREE_POS, 0)?;
        write_u64(
            &*device,
            crate::config::HDR_FREEOFF_POS,
            crate::config::HDR_SIZE,
        )?;
        crate::allocator::init_empty_heads(&*device)?;
        write_u64(&*device, HDR_ROOTPTR_POS, 0)?;
        device.sync()?;

        let mut allocator = Allocator::open(device.clone())?;
        let mut tag_gen = crate::node::TagGenerator::seeded();
        let root = Node::new_leaf();
        let root_off = allocator.allocate(NODE_SIZE as u64)?;
        root.write(&*device, root_off, tag_gen.next())?;
        device.sync()?;
        write_u64(&*device, HDR_ROOTPTR_POS, root_off)?;
        device.sync()?;

        Ok(Tree {
            device,
            allocator,
            tag_gen,
            write_barrier: true,
            root_offset: root_off,
        })
    }

    /// Open an existing tree file, validating its magic.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Tree> {
        let device: Rc<dyn ByteDevice> = Rc::new(OsFileDevice::open_existing(path)?);
        let mut magic = [0u8; 16];
        device.pread(&mut magic, HDR_MAGIC_POS)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }

        let root_offset = crate::codec::read_u64(&*device, HDR_ROOTPTR_POS)?;
        let allocator = Allocator::open(device.clone())?;
        let tag_gen = crate::node::TagGenerator::seeded();

        Ok(Tree {
            device,
            allocator,
            tag_gen,
            write_barrier: true,
            root_offset,
        })
    }

    /// Open `path` if it exists, otherwise create a new tree there.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Tree> {
        if path.as_ref().exists() {
            Tree::open(path)
        } else {
            Tree::create(path)
        }
    }

    /// Enable or disable the durability barrier after every publishing
    /// write. Disabling it trades crash-safety for throughput; it has no
    /// effect on the COW discipline itself, only on how aggressively the
    /// device is asked to flush.
    pub fn set_write_barrier(&mut self, enabled: bool) {
        self.write_barrier = enabled;
        self.allocator.set_write_barrier(enabled);
    }

    fn barrier(&self) -> Result<()> {
        if self.write_barrier {
            self.device.sync()?;
        }
        Ok(())
    }

    fn allocate_and_write_node(&mut self, node: &Node) -> Result<u64> {
        let offset = self.allocator.allocate(NODE_SIZE as u64)?;
        let tag = self.tag_gen.next();
        node.write(&*self.device, offset, tag)?;
        Ok(offset)
    }

    fn publish(&mut self, referrer: &PointerRef, new_offset: u64) -> Result<()> {
        match referrer {
            PointerRef::Root => {
                write_u64(&*self.device, HDR_ROOTPTR_POS, new_offset)?;
                self.root_offset = new_offset;
            }
            PointerRef::Child { node_offset, index } => {
                let slot = node_offset + CHILDREN_OFF as u64 + (*index as u64) * 8;
                write_u64(&*self.device, slot, new_offset)?;
            }
        }
        self.barrier()
    }

    /// Look up `key`, returning the offset of its value extent.
    pub fn find(&self, key: &Key) -> Result<u64> {
        let mut offset = self.root_offset;
        loop {
            let node = Node::read(&*self.device, offset)?;
            let i = find_slot(&node.keys[..node.numkeys], key);
            if i < node.numkeys && &node.keys[i] == key {
                return Ok(node.values[i]);
            }
            if node.is_leaf {
                return Err(Error::NotFound);
            }
            let child = node.children[i];
            if child == 0 {
                return Err(Error::NotFound);
            }
            offset = child;
        }
    }

    /// Read the value extent at `value_offset` into `buf`. `buf` must be
    /// exactly the length the extent was allocated with.
    pub fn read_value(&self, value_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.device.pread(buf, value_offset)
    }

    /// Size in bytes of the value extent at `value_offset`.
    pub fn size_of_value(&self, value_offset: u64) -> Result<u64> {
        self.allocator.size_of(value_offset)
    }

    /// A first-class handle on one value extent's bytes, sized up front
    /// rather than requiring the caller to track the extent's length
    /// alongside its offset.
    pub fn value_reader(&self, value_offset: u64) -> Result<ValueReader<'_>> {
        let size = self.size_of_value(value_offset)?;
        Ok(ValueReader {
            tree: self,
            offset: value_offset,
            size,
        })
    }

    /// Insert `key` with `value`, or, if it already exists and `replace` is
    /// true, overwrite its value in place. Returns [`Error::Exists`] if the
    /// key is already present and `replace` is false.
    pub fn add(&mut self, key: &Key, value: &[u8], replace: bool) -> Result<()> {
        let mut node_offset = self.root_offset;
        let mut node = Node::read(&*self.device, node_offset)?;

        if node.is_full() {
            let (median_key, median_value, left, right) = split_full_node(&node);
            let left_off = self.allocate_and_write_node(&left)?;
            let right_off = self.allocate_and_write_node(&right)?;

            let synthetic = Node {
                is_leaf: false,
                numkeys: 0,
                keys: Vec::new(),
                values: Vec::new(),
                children: vec![node_offset],
            };
            let new_root = insert_median(&synthetic, 0, median_key, median_value, left_off, right_off);
            let new_root_off = self.allocate_and_write_node(&new_root)?;
            self.barrier()?;
            self.publish(&PointerRef::Root, new_root_off)?;
            self.allocator.free(node_offset)?;

            node_offset = new_root_off;
            node = new_root;
        }

        let mut referrer = PointerRef::Root;

        loop {
            let i = find_slot(&node.keys[..node.numkeys], key);

            if i < node.numkeys && &node.keys[i] == key {
                if !replace {
                    return Err(Error::Exists);
                }
                return self.replace_value(node_offset, i, node.values[i], value);
            }

            if node.is_leaf {
                return self.insert_into_leaf(&node, node_offset, &referrer, i, key, value);
            }

            let child_off = node.children[i];
            let child = Node::read(&*self.device, child_off)?;

            if !child.is_full() {
                referrer = PointerRef::Child {
                    node_offset,
                    index: i,
                };
                node_offset = child_off;
                node = child;
                continue;
            }

            let (median_key, median_value, left, right) = split_full_node(&child);
            let left_off = self.allocate_and_write_node(&left)?;
            let right_off = self.allocate_and_write_node(&right)?;
            let new_node = insert_median(&node, i, median_key, median_value, left_off, right_off);
            let new_node_off = self.allocate_and_write_node(&new_node)?;
            self.barrier()?;
            self.publish(&referrer, new_node_off)?;
            self.allocator.free(node_offset)?;
            self.allocator.free(child_off)?;

            if key == &new_node.keys[i] {
                if !replace {
                    return Err(Error::Exists);
                }
                return self.replace_value(new_node_off, i, new_node.values[i], value);
            }

            let (next_off, next_index) = if key < &new_node.keys[i] {
                (left_off, i)
            } else {
                (right_off, i + 1)
            };
            referrer = PointerRef::Child {
                node_offset: new_node_off,
                index: next_index,
            };
            node_offset = next_off;
            node = Node::read(&*self.device, next_off)?;
        }
    }

    fn replace_value(&mut self, node_offset: u64, index: usize, old_value_off: u64, value: &[u8]) -> Result<()> {
        let value_off = self.allocator.allocate(value.len() as u64)?;
        self.device.pwrite(value, value_off)?;
        self.barrier()?;

        let slot = node_offset + VALUES_OFF as u64 + (index as u64) * 8;
        write_u64(&*self.device, slot, value_off)?;
        self.barrier()?;

        self.allocator.free(old_value_off)?;
        Ok(())
    }

    fn insert_into_leaf(
        &mut self,
        leaf: &Node,
        leaf_offset: u64,
        referrer: &PointerRef,
        index: usize,
        key: &Key,
        value: &[u8],
    ) -> Result<()> {
        let value_off = self.allocator.allocate(value.len() as u64)?;
        self.device.pwrite(value, value_off)?;
        self.barrier()?;

        let mut new_leaf = leaf.clone();
        new_leaf.keys.insert(index, *key);
        new_leaf.values.insert(index, value_off);
        new_leaf.numkeys += 1;

        let new_leaf_off = self.allocate_and_write_node(&new_leaf)?;
        self.barrier()?;
        self.publish(referrer, new_leaf_off)?;
        self.allocator.free(leaf_offset)?;
        Ok(())
    }

    /// Visit every key in ascending order, calling `callback(key, value_offset)`.
    pub fn in_order_each<F: FnMut(&Key, u64)>(&self, callback: &mut F) -> Result<()> {
        self.in_order_node(self.root_offset, callback)
    }

    fn in_order_node<F: FnMut(&Key, u64)>(&self, offset: u64, callback: &mut F) -> Result<()> {
        let node = Node::read(&*self.device, offset)?;
        if node.is_leaf {
            for i in 0..node.numkeys {
                callback(&node.keys[i], node.values[i]);
            }
        } else {
            for i in 0..node.numkeys {
                self.in_order_node(node.children[i], callback)?;
                callback(&node.keys[i], node.values[i]);
            }
            self.in_order_node(node.children[node.numkeys], callback)?;
        }
        Ok(())
    }

    /// Collect every (key, value_offset) pair in ascending order. Intended
    /// for debugging and tests, not for production traversal of large
    /// trees.
    pub fn dump(&self) -> Result<Vec<(Key, u64)>> {
        let mut out = Vec::new();
        self.in_order_each(&mut |k, v| out.push((*k, v)))?;
        Ok(out)
    }

    /// Approximate number of keys in the tree, obtained by a full
    /// traversal. Not a cached counter: the on-disk format carries none.
    pub fn len_hint(&self) -> Result<usize> {
        let mut count = 0usize;
        self.in_order_each(&mut |_, _| count += 1)?;
        Ok(count)
    }
}

/// A sized, read-only view onto one value extent.
pub struct ValueReader<'a> {
    tree: &'a Tree,
    offset: u64,
    size: u64,
}

impl<'a> ValueReader<'a> {
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read the whole extent into a freshly allocated buffer.
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size as usize];
        self.tree.read_value(self.offset, &mut buf)?;
        Ok(buf)
    }
}

/// First index `i` in `keys` (sorted ascending) with `key <= keys[i]`, or
/// `keys.len()` if no such index exists.
fn find_slot(keys: &[Key], key: &Key) -> usize {
    for (i, k) in keys.iter().enumerate() {
        if key <= k {
            return i;
        }
    }
    keys.len()
}

/// Split a full node (exactly [`MAX_KEYS`] keys) at its median, returning
/// the promoted (key, value) pair and the two halves that replace it.
fn split_full_node(child: &Node) -> (Key, u64, Node, Node) {
    let h = (MAX_KEYS - 1) / 2;
    let median_key = child.keys[h];
    let median_value = child.values[h];

    let left = Node {
        is_leaf: child.is_leaf,
        numkeys: h,
        keys: child.keys[0..h].to_vec(),
        values: child.values[0..h].to_vec(),
        children: if child.is_leaf {
            Vec::new()
        } else {
            child.children[0..=h].to_vec()
        },
    };
    let right = Node {
        is_leaf: child.is_leaf,
        numkeys: MAX_KEYS - h - 1,
        keys: child.keys[h + 1..MAX_KEYS].to_vec(),
        values: child.values[h + 1..MAX_KEYS].to_vec(),
        children: if child.is_leaf {
            Vec::new()
        } else {
            child.children[h + 1..=MAX_KEYS].to_vec()
        },
    };
    (median_key, median_value, left, right)
}

/// Build the updated parent that results from inserting a promoted median
/// at position `i`, replacing `parent.children[i]` with `left_off` and
/// inserting `right_off` immediately after it.
fn insert_median(
    parent: &Node,
    i: usize,
    median_key: Key,
    median_value: u64,
    left_off: u64,
    right_off: u64,
) -> Node {
    let mut p = parent.clone();
    p.keys.insert(i, median_key);
    p.values.insert(i, median_value);
    p.children[i] = left_off;
    p.children.insert(i + 1, right_off);
    p.numkeys += 1;
    p
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    fn key(n: u32) -> Key {
        let mut k = [0u8; 16];
        k[12..16].copy_from_slice(&n.to_be_bytes());
        k
    }

    fn val(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn fresh_tree_finds_nothing() {
        let dir = tempdir().unwrap();
        let tree = Tree::create(dir.path().join("t.db")).unwrap();
        assert!(matches!(tree.find(&key(1)), Err(Error::NotFound)));
    }

    #[test]
    fn insert_then_find_round_trips() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();
        tree.add(&key(1), &val(100), false).unwrap();
        let off = tree.find(&key(1)).unwrap();
        let mut buf = [0u8; 4];
        tree.read_value(off, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), 100);
    }

    #[test]
    fn duplicate_insert_without_replace_fails() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();
        tree.add(&key(1), &val(1), false).unwrap();
        assert!(matches!(
            tree.add(&key(1), &val(2), false),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn replace_updates_value_and_frees_old_extent() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();
        tree.add(&key(1), &val(1), false).unwrap();
        tree.add(&key(1), &val(2), true).unwrap();
        let off = tree.find(&key(1)).unwrap();
        let mut buf = [0u8; 4];
        tree.read_value(off, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), 2);
    }

    #[test]
    fn reopening_preserves_the_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let mut tree = Tree::create(&path).unwrap();
            tree.add(&key(7), &val(70), false).unwrap();
        }
        let tree = Tree::open(&path).unwrap();
        let off = tree.find(&key(7)).unwrap();
        let mut buf = [0u8; 4];
        tree.read_value(off, &mut buf).unwrap();
        assert_eq!(u32::from_be_bytes(buf), 70);
    }

    #[test]
    fn opening_a_file_with_bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(matches!(Tree::open(&path), Err(Error::BadMagic)));
    }

    #[test]
    fn many_keys_round_trip_in_ascending_order() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();

        let mut order: Vec<u32> = (0..300).collect();
        // A fixed, deterministic shuffle so the test has no external RNG
        // dependency but still exercises out-of-order insertion.
        for i in 0..order.len() {
            let j = (i * 131 + 7) % order.len();
            order.swap(i, j);
        }

        for &n in &order {
            tree.add(&key(n), &val(n), false).unwrap();
        }

        for &n in &order {
            let off = tree.find(&key(n)).unwrap();
            let mut buf = [0u8; 4];
            tree.read_value(off, &mut buf).unwrap();
            assert_eq!(u32::from_be_bytes(buf), n);
        }

        let dumped = tree.dump().unwrap();
        assert_eq!(dumped.len(), 300);
        for w in dumped.windows(2) {
            assert!(w[0].0 < w[1].0);
        }
    }

    #[test]
    fn value_reader_reports_size_and_bytes() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();
        tree.add(&key(1), b"hello", false).unwrap();
        let off = tree.find(&key(1)).unwrap();
        let reader = tree.value_reader(off).unwrap();
        assert_eq!(reader.len(), 5);
        assert!(!reader.is_empty());
        assert_eq!(reader.read_to_vec().unwrap(), b"hello");
    }

    #[test]
    fn root_splits_once_max_keys_is_exceeded() {
        let dir = tempdir().unwrap();
        let mut tree = Tree::create(dir.path().join("t.db")).unwrap();
        for n in 0..(MAX_KEYS as u32 + 1) {
            tree.add(&key(n), &val(n), false).unwrap();
        }
        let root = Node::read(&*tree.device, tree.root_offset).unwrap();
        assert!(!root.is_leaf);
        assert_eq!(root.numkeys, 1);

        for n in 0..(MAX_KEYS as u32 + 1) {
            let off = tree.find(&key(n)).unwrap();
            let mut buf = [0u8; 4];
            tree.read_value(off, &mut buf).unwrap();
            assert_eq!(u32::from_be_bytes(buf), n);
        }
    }
}
