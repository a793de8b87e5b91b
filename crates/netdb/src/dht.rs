//! Binary trie over identity hashes, bit by bit.
//!
//! A node holds either a single hash or two subtrees; inserting a second
//! hash into a leaf subdivides it at the first distinguishing bit, and
//! removal collapses single-child chains back up. Descent prefers the side
//! matching the target's bit, so the first filter-passing leaf found is the
//! XOR-closest entry.

use veil_core::IdentHash;

#[derive(Default)]
struct DhtNode {
    zero: Option<Box<DhtNode>>,
    one: Option<Box<DhtNode>>,
    hash: Option<IdentHash>,
}

impl DhtNode {
    fn is_empty(&self) -> bool {
        self.zero.is_none() && self.one.is_none() && self.hash.is_none()
    }

    /// Pull a lone child's hash up into this node.
    fn move_hash_up(&mut self, from_one: bool) {
        let side = if from_one { &mut self.one } else { &mut self.zero };
        if let Some(child) = side.take() {
            self.hash = child.hash;
        }
    }
}

#[derive(Default)]
pub struct DhtTable {
    root: DhtNode,
    size: usize,
}

impl DhtTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn insert(&mut self, hash: IdentHash) {
        let mut node = &mut self.root;
        let mut level = 0;
        loop {
            if let Some(existing) = node.hash {
                if existing == hash {
                    return;
                }
                // subdivide until the two hashes part ways
                node.hash = None;
                self.size -= 1;
                let mut current = node;
                let mut l = level;
                while existing.bit(l) == hash.bit(l) {
                    let side = if hash.bit(l) {
                        &mut current.one
                    } else {
                        &mut current.zero
                    };
                    current = side.get_or_insert_with(Default::default);
                    l += 1;
                }
                let (a, b) = if hash.bit(l) {
                    (&mut current.one, &mut current.zero)
                } else {
                    (&mut current.zero, &mut current.one)
                };
                let leaf = a.get_or_insert_with(Default::default);
                leaf.hash = Some(hash);
                let other = b.get_or_insert_with(Default::default);
                other.hash = Some(existing);
                self.size += 2;
                return;
            }
            if node.zero.is_none() && node.one.is_none() {
                node.hash = Some(hash);
                self.size += 1;
                return;
            }
            let side = if hash.bit(level) {
                &mut node.one
            } else {
                &mut node.zero
            };
            node = side.get_or_insert_with(Default::default);
            level += 1;
        }
    }

    pub fn remove(&mut self, hash: &IdentHash) -> bool {
        let removed = Self::remove_at(&mut self.root, hash, 0);
        if removed {
            self.size -= 1;
        }
        removed
    }

    fn remove_at(node: &mut DhtNode, hash: &IdentHash, level: usize) -> bool {
        if node.hash.as_ref() == Some(hash) {
            node.hash = None;
            return true;
        }
        let from_one = hash.bit(level);
        let side = if from_one { &mut node.one } else { &mut node.zero };
        let Some(child) = side else { return false };
        if !Self::remove_at(child, hash, level + 1) {
            return false;
        }
        if child.is_empty() {
            *side = None;
            // the sibling may now be a lone leaf worth pulling up
            let sibling_leaf = if from_one {
                node.zero.as_ref().is_some_and(|n| n.hash.is_some())
            } else {
                node.one.as_ref().is_some_and(|n| n.hash.is_some())
            };
            if sibling_leaf {
                node.move_hash_up(!from_one);
            }
        } else {
            let child_is_leaf = child.hash.is_some();
            let sibling_missing = if from_one {
                node.zero.is_none()
            } else {
                node.one.is_none()
            };
            if child_is_leaf && sibling_missing {
                node.move_hash_up(from_one);
            }
        }
        true
    }

    /// XOR-closest entry passing `filter`.
    pub fn find_closest<F>(&self, target: &IdentHash, filter: F) -> Option<IdentHash>
    where
        F: Fn(&IdentHash) -> bool,
    {
        Self::closest_at(&self.root, target, 0, &filter)
    }

    fn closest_at<F>(
        node: &DhtNode,
        target: &IdentHash,
        level: usize,
        filter: &F,
    ) -> Option<IdentHash>
    where
        F: Fn(&IdentHash) -> bool,
    {
        if let Some(hash) = &node.hash {
            return filter(hash).then_some(*hash);
        }
        let (preferred, fallback) = if target.bit(level) {
            (&node.one, &node.zero)
        } else {
            (&node.zero, &node.one)
        };
        for side in [preferred, fallback] {
            if let Some(child) = side {
                if let Some(found) = Self::closest_at(child, target, level + 1, filter) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Up to `num` entries in XOR-distance order, each passing `filter`.
    pub fn find_closest_n<F>(&self, target: &IdentHash, num: usize, filter: F) -> Vec<IdentHash>
    where
        F: Fn(&IdentHash) -> bool,
    {
        let mut out = Vec::new();
        if num > 0 {
            Self::closest_n_at(&self.root, target, 0, num, &filter, &mut out);
        }
        out
    }

    fn closest_n_at<F>(
        node: &DhtNode,
        target: &IdentHash,
        level: usize,
        num: usize,
        filter: &F,
        out: &mut Vec<IdentHash>,
    ) where
        F: Fn(&IdentHash) -> bool,
    {
        if out.len() >= num {
            return;
        }
        if let Some(hash) = &node.hash {
            if filter(hash) {
                out.push(*hash);
            }
            return;
        }
        let (preferred, fallback) = if target.bit(level) {
            (&node.one, &node.zero)
        } else {
            (&node.zero, &node.one)
        };
        if let Some(child) = preferred {
            Self::closest_n_at(child, target, level + 1, num, filter, out);
        }
        if out.len() < num {
            if let Some(child) = fallback {
                Self::closest_n_at(child, target, level + 1, num, filter, out);
            }
        }
    }

    /// Remove every entry failing `filter`. Used to expire routers.
    pub fn cleanup<F>(&mut self, filter: F)
    where
        F: Fn(&IdentHash) -> bool,
    {
        let mut doomed = Vec::new();
        Self::collect(&self.root, &mut |h| {
            if !filter(h) {
                doomed.push(*h);
            }
        });
        for hash in doomed {
            self.remove(&hash);
        }
    }

    fn collect(node: &DhtNode, visit: &mut impl FnMut(&IdentHash)) {
        if let Some(hash) = &node.hash {
            visit(hash);
        }
        if let Some(child) = &node.zero {
            Self::collect(child, visit);
        }
        if let Some(child) = &node.one {
            Self::collect(child, visit);
        }
    }
}
