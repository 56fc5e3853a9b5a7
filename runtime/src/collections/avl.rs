// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the helios render project. All rights reserved.

//! Height-balanced search tree over a pooled node arena.

use crate::collections::pool::{FixedPool, NIL};

const NODE_CHUNK: usize = 256;

struct Node<K, V> {
    key: K,
    value: V,
    left: u32,
    right: u32,
    height: i32,
}

pub struct AvlTree<K, V> {
    pool: FixedPool<Node<K, V>>,
    root: u32,
}

impl<K: Ord, V> Default for AvlTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> AvlTree<K, V> {
    pub fn new() -> Self {
        AvlTree {
            pool: FixedPool::new(NODE_CHUNK),
            root: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn height(&self) -> i32 {
        self.height_of(self.root)
    }

    pub fn clear(&mut self) {
        self.pool.clear();
        self.root = NIL;
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut cur = self.root;
        while cur != NIL {
            let node = self.pool.get(cur)?;
            cur = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut cur = self.root;
        while cur != NIL {
            let node = self.pool.get(cur)?;
            match key.cmp(&node.key) {
                std::cmp::Ordering::Less => cur = node.left,
                std::cmp::Ordering::Greater => cur = node.right,
                std::cmp::Ordering::Equal => break,
            };
        }
        if cur == NIL {
            None
        } else {
            self.pool.get_mut(cur).map(|n| &mut n.value)
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts, returning the previous value when the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let mut replaced = None;
        self.root = self.insert_at(self.root, key, value, &mut replaced);
        replaced
    }

    /// Removes, returning the value when the key was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let mut removed = None;
        self.root = self.remove_at(self.root, key, &mut removed);
        removed
    }

    /// Visits entries in key order.
    pub fn inorder<F: FnMut(&K, &V)>(&self, mut visit: F) {
        self.inorder_at(self.root, &mut visit);
    }

    fn inorder_at<F: FnMut(&K, &V)>(&self, node: u32, visit: &mut F) {
        if node == NIL {
            return;
        }
        let n = self.pool.get(node).unwrap();
        let (left, right) = (n.left, n.right);
        self.inorder_at(left, visit);
        let n = self.pool.get(node).unwrap();
        visit(&n.key, &n.value);
        self.inorder_at(right, visit);
    }

    fn height_of(&self, node: u32) -> i32 {
        if node == NIL {
            0
        } else {
            self.pool.get(node).unwrap().height
        }
    }

    fn update_height(&mut self, node: u32) {
        let (l, r) = {
            let n = self.pool.get(node).unwrap();
            (n.left, n.right)
        };
        let h = 1 + self.height_of(l).max(self.height_of(r));
        self.pool.get_mut(node).unwrap().height = h;
    }

    fn balance_factor(&self, node: u32) -> i32 {
        let n = self.pool.get(node).unwrap();
        self.height_of(n.left) - self.height_of(n.right)
    }

    fn rotate_right(&mut self, node: u32) -> u32 {
        let left = self.pool.get(node).unwrap().left;
        let left_right = self.pool.get(left).unwrap().right;
        self.pool.get_mut(node).unwrap().left = left_right;
        self.pool.get_mut(left).unwrap().right = node;
        self.update_height(node);
        self.update_height(left);
        left
    }

    fn rotate_left(&mut self, node: u32) -> u32 {
        let right = self.pool.get(node).unwrap().right;
        let right_left = self.pool.get(right).unwrap().left;
        self.pool.get_mut(node).unwrap().right = right_left;
        self.pool.get_mut(right).unwrap().left = node;
        self.update_height(node);
        self.update_height(right);
        right
    }

    fn rebalance(&mut self, node: u32) -> u32 {
        self.update_height(node);
        let bf = self.balance_factor(node);
        if bf > 1 {
            let left = self.pool.get(node).unwrap().left;
            if self.balance_factor(left) < 0 {
                let new_left = self.rotate_left(left);
                self.pool.get_mut(node).unwrap().left = new_left;
            }
            return self.rotate_right(node);
        }
        if bf < -1 {
            let right = self.pool.get(node).unwrap().right;
            if self.balance_factor(right) > 0 {
                let new_right = self.rotate_right(right);
                self.pool.get_mut(node).unwrap().right = new_right;
            }
            return self.rotate_left(node);
        }
        node
    }

    fn insert_at(&mut self, node: u32, key: K, value: V, replaced: &mut Option<V>) -> u32 {
        if node == NIL {
            return self.pool.alloc(Node {
                key,
                value,
                left: NIL,
                right: NIL,
                height: 1,
            });
        }

        match key.cmp(&self.pool.get(node).unwrap().key) {
            std::cmp::Ordering::Less => {
                let left = self.pool.get(node).unwrap().left;
                let new_left = self.insert_at(left, key, value, replaced);
                self.pool.get_mut(node).unwrap().left = new_left;
            }
            std::cmp::Ordering::Greater => {
                let right = self.pool.get(node).unwrap().right;
                let new_right = self.insert_at(right, key, value, replaced);
                self.pool.get_mut(node).unwrap().right = new_right;
            }
            std::cmp::Ordering::Equal => {
                let n = self.pool.get_mut(node).unwrap();
                *replaced = Some(std::mem::replace(&mut n.value, value));
                return node;
            }
        }

        self.rebalance(node)
    }

    fn remove_at(&mut self, node: u32, key: &K, removed: &mut Option<V>) -> u32 {
        if node == NIL {
            return NIL;
        }

        match key.cmp(&self.pool.get(node).unwrap().key) {
            std::cmp::Ordering::Less => {
                let left = self.pool.get(node).unwrap().left;
                let new_left = self.remove_at(left, key, removed);
                self.pool.get_mut(node).unwrap().left = new_left;
            }
            std::cmp::Ordering::Greater => {
                let right = self.pool.get(node).unwrap().right;
                let new_right = self.remove_at(right, key, removed);
                self.pool.get_mut(node).unwrap().right = new_right;
            }
            std::cmp::Ordering::Equal => {
                let (left, right) = {
                    let n = self.pool.get(node).unwrap();
                    (n.left, n.right)
                };

                if left == NIL || right == NIL {
                    let child = if left != NIL { left } else { right };
                    let n = self.pool.free(node);
                    *removed = Some(n.value);
                    return child;
                }

                // Two children: replace with the inorder successor.
                let succ = self.min_of(right);
                let new_right = self.detach_min(right);
                {
                    let s = self.pool.get_mut(succ).unwrap();
                    s.left = left;
                    s.right = new_right;
                }
                let n = self.pool.free(node);
                *removed = Some(n.value);
                return self.rebalance(succ);
            }
        }

        self.rebalance(node)
    }

    fn min_of(&self, mut node: u32) -> u32 {
        loop {
            let left = self.pool.get(node).unwrap().left;
            if left == NIL {
                return node;
            }
            node = left;
        }
    }

    /// Unlinks the minimum node of the subtree without freeing it, and
    /// returns the rebalanced subtree root.
    fn detach_min(&mut self, node: u32) -> u32 {
        let left = self.pool.get(node).unwrap().left;
        if left == NIL {
            return self.pool.get(node).unwrap().right;
        }
        let new_left = self.detach_min(left);
        self.pool.get_mut(node).unwrap().left = new_left;
        self.rebalance(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[test]
    fn test_insert_get_remove() {
        let mut tree = AvlTree::new();
        assert_eq!(tree.insert(5, "five"), None);
        assert_eq!(tree.insert(2, "two"), None);
        assert_eq!(tree.insert(5, "FIVE"), Some("five"));
        assert_eq!(tree.get(&5), Some(&"FIVE"));
        assert_eq!(tree.remove(&2), Some("two"));
        assert_eq!(tree.remove(&2), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_churn_keeps_order_and_balance() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut keys: Vec<u32> = (0..10_000).collect();
        keys.shuffle(&mut rng);

        let mut tree = AvlTree::new();
        for &k in &keys {
            tree.insert(k, k as u64 * 2);
        }
        assert_eq!(tree.len(), 10_000);

        keys.shuffle(&mut rng);
        for &k in keys.iter().take(5_000) {
            assert!(tree.remove(&k).is_some());
        }
        assert_eq!(tree.len(), 5_000);

        let mut inorder = vec![];
        tree.inorder(|k, _| inorder.push(*k));
        assert_eq!(inorder.len(), 5_000);
        assert!(inorder.windows(2).all(|w| w[0] < w[1]));

        let expected: Vec<u32> = {
            let removed: std::collections::HashSet<u32> =
                keys.iter().take(5_000).copied().collect();
            (0..10_000).filter(|k| !removed.contains(k)).collect()
        };
        assert_eq!(inorder, expected);

        let bound = 1.44 * (tree.len() as f64).log2() + 2.0;
        assert!(
            (tree.height() as f64) <= bound,
            "height {} exceeds {}",
            tree.height(),
            bound
        );
    }

    #[test]
    fn test_degenerate_insert_order() {
        let mut tree = AvlTree::new();
        for k in 0..1024 {
            tree.insert(k, ());
        }
        assert!(tree.height() <= 11);
    }
}
