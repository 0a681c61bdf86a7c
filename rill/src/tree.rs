//! An ordered map backed by a B+ tree with a caller-supplied comparator.
//!
//! Indexes and ordered query windows need a sorted `(key, value)` map with
//! bounded range scans in both directions, strict successor and predecessor
//! lookups, and cheap clones. Nodes are shared between clones through `Rc`
//! and copied on first write, so a clone costs one pointer and edits never
//! disturb other handles.
//!
//! Invariants: keys are strictly sorted under the comparator; an internal
//! node's i-th key equals the maximum key of its i-th child; after any
//! editing pass, children at or below half occupancy are merged with a
//! neighbor and a degenerate root is replaced by its sole child.

use std::cmp::Ordering;
use std::rc::Rc;

/// The smallest permitted branching factor.
pub const MIN_NODE_SIZE: usize = 4;
/// The largest permitted branching factor.
pub const MAX_NODE_SIZE: usize = 256;
/// The branching factor used unless one is requested.
pub const DEFAULT_NODE_SIZE: usize = 32;

/// A total order over keys.
pub type Comparator<K> = Rc<dyn Fn(&K, &K) -> Ordering>;

/// What a range visitor wants done with the pair it was shown.
#[derive(Clone, Debug, Default)]
pub struct RangeAction<V> {
    /// Replace the value stored under the visited key.
    pub set_value: Option<V>,
    /// Remove the visited pair.
    pub delete: bool,
    /// Stop the scan after this pair.
    pub stop: bool,
}

impl<V> RangeAction<V> {
    /// Keep the pair and continue scanning.
    pub fn keep() -> Self {
        RangeAction { set_value: None, delete: false, stop: false }
    }

    /// Remove the pair and continue scanning.
    pub fn remove() -> Self {
        RangeAction { set_value: None, delete: true, stop: false }
    }

    /// Stop the scan after this pair.
    pub fn stop() -> Self {
        RangeAction { set_value: None, delete: false, stop: true }
    }
}

enum Node<K, V> {
    Leaf { keys: Vec<K>, values: Vec<V> },
    Internal { keys: Vec<K>, children: Vec<Rc<Node<K, V>>> },
}

impl<K: Clone, V: Clone> Clone for Node<K, V> {
    fn clone(&self) -> Self {
        match self {
            Node::Leaf { keys, values } => {
                Node::Leaf { keys: keys.clone(), values: values.clone() }
            }
            Node::Internal { keys, children } => {
                Node::Internal { keys: keys.clone(), children: children.clone() }
            }
        }
    }
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn len(&self) -> usize {
        match self {
            Node::Leaf { keys, .. } => keys.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    fn max_key(&self) -> Option<&K> {
        match self {
            Node::Leaf { keys, .. } => keys.last(),
            Node::Internal { keys, .. } => keys.last(),
        }
    }
}

fn search<K>(keys: &[K], key: &K, cmp: &dyn Fn(&K, &K) -> Ordering) -> Result<usize, usize> {
    keys.binary_search_by(|probe| cmp(probe, key))
}

/// Index of the child responsible for `key`: the first child whose max key is
/// not below `key`, or the last child when `key` exceeds every max.
fn child_for<K>(keys: &[K], key: &K, cmp: &dyn Fn(&K, &K) -> Ordering) -> usize {
    match search(keys, key, cmp) {
        Ok(index) => index,
        Err(index) => index.min(keys.len().saturating_sub(1)),
    }
}

enum SetOutcome<K, V> {
    /// Inserted a fresh pair, possibly splitting the node.
    Inserted(Option<(K, Rc<Node<K, V>>)>),
    /// Overwrote an existing pair.
    Replaced(V),
    /// Found an existing pair and left it alone.
    Kept,
}

/// An ordered `(key, value)` map with copy-on-write structural sharing.
pub struct Tree<K, V> {
    root: Rc<Node<K, V>>,
    size: usize,
    max_node_size: usize,
    cmp: Comparator<K>,
}

impl<K: Clone, V: Clone> Clone for Tree<K, V> {
    fn clone(&self) -> Self {
        Tree {
            root: Rc::clone(&self.root),
            size: self.size,
            max_node_size: self.max_node_size,
            cmp: Rc::clone(&self.cmp),
        }
    }
}

impl<K: Clone, V: Clone> Tree<K, V> {
    /// A tree with the default branching factor.
    pub fn new(cmp: Comparator<K>) -> Self {
        Self::with_branching(cmp, DEFAULT_NODE_SIZE)
    }

    /// A tree with a chosen branching factor, clamped to the permitted range.
    pub fn with_branching(cmp: Comparator<K>, branching: usize) -> Self {
        Tree {
            root: Rc::new(Node::Leaf { keys: Vec::new(), values: Vec::new() }),
            size: 0,
            max_node_size: branching.clamp(MIN_NODE_SIZE, MAX_NODE_SIZE),
            cmp,
        }
    }

    /// The number of stored pairs.
    pub fn len(&self) -> usize {
        self.size
    }

    /// True when no pairs are stored.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Remove every pair.
    pub fn clear(&mut self) {
        self.root = Rc::new(Node::Leaf { keys: Vec::new(), values: Vec::new() });
        self.size = 0;
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Leaf { keys, values } => {
                    return match search(keys, key, self.cmp.as_ref()) {
                        Ok(index) => Some(&values[index]),
                        Err(_) => None,
                    };
                }
                Node::Internal { keys, children } => {
                    if keys.is_empty() {
                        return None;
                    }
                    let index = child_for(keys, key, self.cmp.as_ref());
                    if (self.cmp)(key, &keys[index]) == Ordering::Greater {
                        return None;
                    }
                    node = children[index].as_ref();
                }
            }
        }
    }

    /// True when a pair is stored under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Store `value` under `key`. When a pair already exists it is replaced
    /// only if `overwrite` is set; the previous value is returned on
    /// replacement. Returns `Ok(None)` for a fresh insertion.
    ///
    /// A key that is not equal to itself under the comparator (a NaN-like
    /// value) is rejected by panicking before any state changes.
    pub fn set(&mut self, key: K, value: V, overwrite: bool) -> Option<V> {
        assert!(
            (self.cmp)(&key, &key) == Ordering::Equal,
            "key is unordered under the tree's comparator"
        );
        let max = self.max_node_size;
        let cmp = Rc::clone(&self.cmp);
        match Self::set_in(&mut self.root, key, value, overwrite, cmp.as_ref(), max) {
            SetOutcome::Inserted(split) => {
                if let Some((_, sibling)) = split {
                    let left = Rc::clone(&self.root);
                    let keys = vec![
                        left.max_key().expect("split left half is nonempty").clone(),
                        sibling.max_key().expect("split right half is nonempty").clone(),
                    ];
                    self.root = Rc::new(Node::Internal { keys, children: vec![left, sibling] });
                }
                self.size += 1;
                None
            }
            SetOutcome::Replaced(old) => Some(old),
            SetOutcome::Kept => None,
        }
    }

    fn set_in(
        node: &mut Rc<Node<K, V>>,
        key: K,
        value: V,
        overwrite: bool,
        cmp: &dyn Fn(&K, &K) -> Ordering,
        max: usize,
    ) -> SetOutcome<K, V> {
        match Rc::make_mut(node) {
            Node::Leaf { keys, values } => match search(keys, &key, cmp) {
                Ok(index) => {
                    if overwrite {
                        let old = std::mem::replace(&mut values[index], value);
                        SetOutcome::Replaced(old)
                    } else {
                        SetOutcome::Kept
                    }
                }
                Err(index) => {
                    keys.insert(index, key);
                    values.insert(index, value);
                    let split = if keys.len() > max {
                        let half = keys.len() / 2;
                        let right_keys = keys.split_off(half);
                        let right_values = values.split_off(half);
                        let sibling =
                            Rc::new(Node::Leaf { keys: right_keys, values: right_values });
                        let split_key =
                            sibling.max_key().expect("split right half is nonempty").clone();
                        Some((split_key, sibling))
                    } else {
                        None
                    };
                    SetOutcome::Inserted(split)
                }
            },
            Node::Internal { keys, children } => {
                if keys.is_empty() {
                    // An empty internal node can only be a degenerate root.
                    let leaf = Rc::new(Node::Leaf { keys: vec![key], values: vec![value] });
                    keys.push(leaf.max_key().expect("fresh leaf is nonempty").clone());
                    children.push(leaf);
                    return SetOutcome::Inserted(None);
                }
                let index = child_for(keys, &key, cmp);
                let outcome = Self::set_in(&mut children[index], key, value, overwrite, cmp, max);
                keys[index] = children[index]
                    .max_key()
                    .expect("children stay nonempty on insert")
                    .clone();
                if let SetOutcome::Inserted(Some((split_key, sibling))) = outcome {
                    keys.insert(index + 1, split_key);
                    children.insert(index + 1, sibling);
                    let split = if children.len() > max {
                        let half = children.len() / 2;
                        let right_keys = keys.split_off(half);
                        let right_children = children.split_off(half);
                        let sibling =
                            Rc::new(Node::Internal { keys: right_keys, children: right_children });
                        let split_key =
                            sibling.max_key().expect("split right half is nonempty").clone();
                        Some((split_key, sibling))
                    } else {
                        None
                    };
                    return SetOutcome::Inserted(split);
                }
                outcome
            }
        }
    }

    /// Remove the pair stored under `key`, returning its value.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let cmp = Rc::clone(&self.cmp);
        let max = self.max_node_size;
        let removed = Self::delete_in(&mut self.root, key, cmp.as_ref(), max);
        if removed.is_some() {
            self.size -= 1;
            self.collapse_root();
        }
        removed
    }

    fn delete_in(
        node: &mut Rc<Node<K, V>>,
        key: &K,
        cmp: &dyn Fn(&K, &K) -> Ordering,
        max: usize,
    ) -> Option<V> {
        match Rc::make_mut(node) {
            Node::Leaf { keys, values } => match search(keys, key, cmp) {
                Ok(index) => {
                    keys.remove(index);
                    Some(values.remove(index))
                }
                Err(_) => None,
            },
            Node::Internal { keys, children } => {
                if keys.is_empty() {
                    return None;
                }
                let index = child_for(keys, key, cmp);
                if cmp(key, &keys[index]) == Ordering::Greater {
                    return None;
                }
                let removed = Self::delete_in(&mut children[index], key, cmp, max)?;
                if children[index].len() == 0 {
                    keys.remove(index);
                    children.remove(index);
                } else {
                    keys[index] = children[index]
                        .max_key()
                        .expect("nonempty child has a max key")
                        .clone();
                    Self::rebalance_child(keys, children, index, max);
                }
                Some(removed)
            }
        }
    }

    /// Merge `children[index]` with a neighbor when it has fallen to half
    /// occupancy or below, splitting again if the merged node overflows.
    fn rebalance_child(
        keys: &mut Vec<K>,
        children: &mut Vec<Rc<Node<K, V>>>,
        index: usize,
        max: usize,
    ) {
        if children.len() < 2 || children[index].len() > max / 2 {
            return;
        }
        let left = if index + 1 < children.len() { index } else { index - 1 };
        let right = left + 1;

        let right_node = children.remove(right);
        keys.remove(right);
        {
            let merged = Rc::make_mut(&mut children[left]);
            match (merged, right_node.as_ref()) {
                (
                    Node::Leaf { keys: lk, values: lv },
                    Node::Leaf { keys: rk, values: rv },
                ) => {
                    lk.extend(rk.iter().cloned());
                    lv.extend(rv.iter().cloned());
                }
                (
                    Node::Internal { keys: lk, children: lc },
                    Node::Internal { keys: rk, children: rc },
                ) => {
                    lk.extend(rk.iter().cloned());
                    lc.extend(rc.iter().cloned());
                }
                _ => unreachable!("siblings share a depth"),
            }
        }
        if children[left].len() > max {
            let sibling = {
                let node = Rc::make_mut(&mut children[left]);
                match node {
                    Node::Leaf { keys: lk, values: lv } => {
                        let half = lk.len() / 2;
                        Rc::new(Node::Leaf { keys: lk.split_off(half), values: lv.split_off(half) })
                    }
                    Node::Internal { keys: lk, children: lc } => {
                        let half = lc.len() / 2;
                        Rc::new(Node::Internal {
                            keys: lk.split_off(half),
                            children: lc.split_off(half),
                        })
                    }
                }
            };
            keys[left] = children[left]
                .max_key()
                .expect("split left half is nonempty")
                .clone();
            keys.insert(left + 1, sibling.max_key().expect("split right half is nonempty").clone());
            children.insert(left + 1, sibling);
        } else {
            keys[left] = children[left]
                .max_key()
                .expect("merged node is nonempty")
                .clone();
        }
    }

    fn collapse_root(&mut self) {
        loop {
            let replacement = match self.root.as_ref() {
                Node::Internal { children, .. } if children.len() == 1 => {
                    Rc::clone(&children[0])
                }
                Node::Internal { children, .. } if children.is_empty() => {
                    Rc::new(Node::Leaf { keys: Vec::new(), values: Vec::new() })
                }
                _ => return,
            };
            self.root = replacement;
        }
    }

    /// The smallest key, if any.
    pub fn min_key(&self) -> Option<&K> {
        self.min_pair().map(|(k, _)| k)
    }

    /// The largest key, if any.
    pub fn max_key(&self) -> Option<&K> {
        self.root.max_key()
    }

    /// The pair with the smallest key, if any.
    pub fn min_pair(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Leaf { keys, values } => {
                    return keys.first().map(|k| (k, &values[0]));
                }
                Node::Internal { children, .. } => {
                    node = children.first()?.as_ref();
                }
            }
        }
    }

    /// The pair with the largest key, if any.
    pub fn max_pair(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Leaf { keys, values } => {
                    let last = keys.len().checked_sub(1)?;
                    return Some((&keys[last], &values[last]));
                }
                Node::Internal { children, .. } => {
                    node = children.last()?.as_ref();
                }
            }
        }
    }

    /// The pair with the smallest key strictly greater than `key`, or the
    /// minimum pair when `key` is absent.
    pub fn next_higher_pair(&self, key: Option<&K>) -> Option<(&K, &V)> {
        let key = match key {
            Some(key) => key,
            None => return self.min_pair(),
        };
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Leaf { keys, values } => {
                    let index = match search(keys, key, self.cmp.as_ref()) {
                        Ok(index) => index + 1,
                        Err(index) => index,
                    };
                    return keys.get(index).map(|k| (k, &values[index]));
                }
                Node::Internal { keys, children } => {
                    // First child whose max key is strictly above `key`.
                    let index = keys
                        .iter()
                        .position(|probe| (self.cmp)(probe, key) == Ordering::Greater)?;
                    node = children[index].as_ref();
                }
            }
        }
    }

    /// The pair with the largest key strictly less than `key`, or the
    /// maximum pair when `key` is absent.
    pub fn next_lower_pair(&self, key: Option<&K>) -> Option<(&K, &V)> {
        let key = match key {
            Some(key) => key,
            None => return self.max_pair(),
        };
        Self::lower_in(self.root.as_ref(), key, self.cmp.as_ref())
    }

    fn lower_in<'a>(
        node: &'a Node<K, V>,
        key: &K,
        cmp: &dyn Fn(&K, &K) -> Ordering,
    ) -> Option<(&'a K, &'a V)> {
        match node {
            Node::Leaf { keys, values } => {
                let index = match search(keys, key, cmp) {
                    Ok(index) => index,
                    Err(index) => index,
                };
                let index = index.checked_sub(1)?;
                Some((&keys[index], &values[index]))
            }
            Node::Internal { keys, children } => {
                if keys.is_empty() {
                    return None;
                }
                // First child whose max reaches `key`; every earlier child is
                // entirely below it.
                let index = keys
                    .iter()
                    .position(|probe| cmp(probe, key) != Ordering::Less)
                    .unwrap_or(children.len() - 1);
                if let Some(found) = Self::lower_in(children[index].as_ref(), key, cmp) {
                    return Some(found);
                }
                let index = index.checked_sub(1)?;
                Self::max_pair_of(children[index].as_ref())
            }
        }
    }

    fn max_pair_of(node: &Node<K, V>) -> Option<(&K, &V)> {
        match node {
            Node::Leaf { keys, values } => {
                let last = keys.len().checked_sub(1)?;
                Some((&keys[last], &values[last]))
            }
            Node::Internal { children, .. } => Self::max_pair_of(children.last()?.as_ref()),
        }
    }

    /// Visit pairs with keys in `[low, high]` (or `[low, high)` when
    /// `include_high` is false) in ascending order, applying each visitor
    /// action. Either bound may be `None` for an open end. The visitor
    /// receives the running count of visited pairs and may replace values,
    /// delete pairs, or stop the scan. Returns the number of pairs visited.
    pub fn for_range(
        &mut self,
        low: Option<&K>,
        high: Option<&K>,
        include_high: bool,
        mut visit: impl FnMut(&K, &V, usize) -> RangeAction<V>,
    ) -> usize {
        let mut edits: Vec<(K, Option<V>)> = Vec::new();
        let mut count = 0;
        {
            let cmp = Rc::clone(&self.cmp);
            Self::walk(
                self.root.as_ref(),
                low,
                high,
                include_high,
                cmp.as_ref(),
                &mut count,
                &mut |key, value, count| {
                    let action = visit(key, value, count);
                    if action.delete {
                        edits.push((key.clone(), None));
                    } else if let Some(value) = action.set_value {
                        edits.push((key.clone(), Some(value)));
                    }
                    action.stop
                },
            );
        }
        // Edits are applied on exit so the scan observes a consistent tree;
        // deletion goes through `delete`, which rebalances and collapses a
        // degenerate root.
        for (key, edit) in edits {
            match edit {
                Some(value) => {
                    self.set(key, value, true);
                }
                None => {
                    self.delete(&key);
                }
            }
        }
        count
    }

    /// Visit pairs within the bounds in ascending order without editing.
    /// Returns the number of pairs visited.
    pub fn scan(
        &self,
        low: Option<&K>,
        high: Option<&K>,
        include_high: bool,
        mut visit: impl FnMut(&K, &V, usize) -> bool,
    ) -> usize {
        let mut count = 0;
        Self::walk(
            self.root.as_ref(),
            low,
            high,
            include_high,
            self.cmp.as_ref(),
            &mut count,
            &mut |key, value, count| visit(key, value, count),
        );
        count
    }

    /// Returns true when the walk was stopped early.
    fn walk(
        node: &Node<K, V>,
        low: Option<&K>,
        high: Option<&K>,
        include_high: bool,
        cmp: &dyn Fn(&K, &K) -> Ordering,
        count: &mut usize,
        visit: &mut impl FnMut(&K, &V, usize) -> bool,
    ) -> bool {
        match node {
            Node::Leaf { keys, values } => {
                let start = match low {
                    Some(low) => match search(keys, low, cmp) {
                        Ok(index) => index,
                        Err(index) => index,
                    },
                    None => 0,
                };
                for index in start..keys.len() {
                    if let Some(high) = high {
                        let order = cmp(&keys[index], high);
                        if order == Ordering::Greater
                            || (!include_high && order == Ordering::Equal)
                        {
                            return false;
                        }
                    }
                    let stop = visit(&keys[index], &values[index], *count);
                    *count += 1;
                    if stop {
                        return true;
                    }
                }
                false
            }
            Node::Internal { keys, children } => {
                let start = match low {
                    Some(low) => keys
                        .iter()
                        .position(|probe| cmp(probe, low) != Ordering::Less)
                        .unwrap_or(keys.len()),
                    None => 0,
                };
                for index in start..children.len() {
                    if Self::walk(
                        children[index].as_ref(),
                        low,
                        high,
                        include_high,
                        cmp,
                        count,
                        visit,
                    ) {
                        return true;
                    }
                    if let Some(high) = high {
                        // Once a child's max reaches the bound, later children
                        // are entirely out of range.
                        let order = cmp(&keys[index], high);
                        if order != Ordering::Less {
                            return false;
                        }
                    }
                }
                false
            }
        }
    }

    /// Visit pairs within the bounds in descending order without editing.
    /// Returns the number of pairs visited.
    pub fn scan_reversed(
        &self,
        low: Option<&K>,
        high: Option<&K>,
        include_high: bool,
        mut visit: impl FnMut(&K, &V, usize) -> bool,
    ) -> usize {
        let mut count = 0;
        Self::walk_reversed(
            self.root.as_ref(),
            low,
            high,
            include_high,
            self.cmp.as_ref(),
            &mut count,
            &mut |key, value, count| visit(key, value, count),
        );
        count
    }

    fn walk_reversed(
        node: &Node<K, V>,
        low: Option<&K>,
        high: Option<&K>,
        include_high: bool,
        cmp: &dyn Fn(&K, &K) -> Ordering,
        count: &mut usize,
        visit: &mut impl FnMut(&K, &V, usize) -> bool,
    ) -> bool {
        match node {
            Node::Leaf { keys, values } => {
                for index in (0..keys.len()).rev() {
                    if let Some(high) = high {
                        let order = cmp(&keys[index], high);
                        if order == Ordering::Greater
                            || (!include_high && order == Ordering::Equal)
                        {
                            continue;
                        }
                    }
                    if let Some(low) = low {
                        if cmp(&keys[index], low) == Ordering::Less {
                            return false;
                        }
                    }
                    let stop = visit(&keys[index], &values[index], *count);
                    *count += 1;
                    if stop {
                        return true;
                    }
                }
                false
            }
            Node::Internal { keys, children } => {
                for index in (0..children.len()).rev() {
                    // Skip children entirely below the low bound.
                    if let Some(low) = low {
                        if cmp(&keys[index], low) == Ordering::Less {
                            return false;
                        }
                    }
                    if Self::walk_reversed(
                        children[index].as_ref(),
                        low,
                        high,
                        include_high,
                        cmp,
                        count,
                        visit,
                    ) {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Collect every pair in ascending order.
    pub fn pairs(&self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.size);
        self.scan(None, None, true, |key, value, _| {
            out.push((key.clone(), value.clone()));
            false
        });
        out
    }
}

impl<K: Clone + std::fmt::Debug, V: Clone + std::fmt::Debug> std::fmt::Debug for Tree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.pairs()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn int_tree(branching: usize) -> Tree<i64, i64> {
        Tree::with_branching(Rc::new(|a: &i64, b: &i64| a.cmp(b)), branching)
    }

    #[test]
    fn insert_get_delete() {
        let mut tree = int_tree(4);
        for i in 0..100 {
            assert_eq!(tree.set(i, i * 10, true), None);
        }
        assert_eq!(tree.len(), 100);
        assert_eq!(tree.get(&42), Some(&420));
        assert_eq!(tree.set(42, 0, false), None);
        assert_eq!(tree.get(&42), Some(&420));
        assert_eq!(tree.set(42, 0, true), Some(420));
        assert_eq!(tree.delete(&42), Some(0));
        assert_eq!(tree.get(&42), None);
        assert_eq!(tree.len(), 99);
    }

    #[test]
    fn extremes_and_neighbors() {
        let mut tree = int_tree(4);
        for i in [5, 1, 9, 3, 7] {
            tree.set(i, i, true);
        }
        assert_eq!(tree.min_key(), Some(&1));
        assert_eq!(tree.max_key(), Some(&9));
        assert_eq!(tree.next_higher_pair(Some(&5)), Some((&7, &7)));
        assert_eq!(tree.next_higher_pair(Some(&4)), Some((&5, &5)));
        assert_eq!(tree.next_higher_pair(Some(&9)), None);
        assert_eq!(tree.next_higher_pair(None), Some((&1, &1)));
        assert_eq!(tree.next_lower_pair(Some(&5)), Some((&3, &3)));
        assert_eq!(tree.next_lower_pair(Some(&1)), None);
        assert_eq!(tree.next_lower_pair(None), Some((&9, &9)));
    }

    #[test]
    fn range_scan_bounds() {
        let mut tree = int_tree(4);
        for i in 0..20 {
            tree.set(i, i, true);
        }
        let mut seen = Vec::new();
        tree.scan(Some(&5), Some(&10), true, |k, _, _| {
            seen.push(*k);
            false
        });
        assert_eq!(seen, vec![5, 6, 7, 8, 9, 10]);

        seen.clear();
        tree.scan(Some(&5), Some(&10), false, |k, _, _| {
            seen.push(*k);
            false
        });
        assert_eq!(seen, vec![5, 6, 7, 8, 9]);

        seen.clear();
        tree.scan_reversed(Some(&5), Some(&10), true, |k, _, _| {
            seen.push(*k);
            false
        });
        assert_eq!(seen, vec![10, 9, 8, 7, 6, 5]);
    }

    #[test]
    fn range_edit_in_place() {
        let mut tree = int_tree(4);
        for i in 0..10 {
            tree.set(i, i, true);
        }
        // Delete the even keys in range, double the odd ones, stop at 7.
        tree.for_range(Some(&0), None, true, |k, v, _| {
            if *k == 7 {
                RangeAction::stop()
            } else if *k % 2 == 0 {
                RangeAction::remove()
            } else {
                RangeAction { set_value: Some(*v * 2), delete: false, stop: false }
            }
        });
        assert_eq!(tree.get(&2), None);
        assert_eq!(tree.get(&3), Some(&6));
        assert_eq!(tree.get(&8), Some(&8));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn clone_is_independent() {
        let mut tree = int_tree(4);
        for i in 0..50 {
            tree.set(i, i, true);
        }
        let snapshot = tree.clone();
        for i in 0..50 {
            tree.delete(&i);
        }
        assert!(tree.is_empty());
        assert_eq!(snapshot.len(), 50);
        assert_eq!(snapshot.get(&25), Some(&25));
    }

    #[test]
    fn insertion_order_is_immaterial() {
        use itertools::Itertools;
        let keys: Vec<i64> = vec![5, 1, 9, 3, 7, 4];
        let expected: Vec<(i64, i64)> = {
            let mut sorted: Vec<i64> = keys.clone();
            sorted.sort();
            sorted.into_iter().map(|k| (k, k * 10)).collect()
        };
        for order in keys.iter().permutations(keys.len()) {
            let mut tree = int_tree(4);
            for key in order {
                tree.set(*key, *key * 10, true);
            }
            assert_eq!(tree.pairs(), expected);
            // Deleting in yet another order leaves the survivors sorted.
            tree.delete(&9);
            tree.delete(&1);
            assert_eq!(
                tree.pairs(),
                expected.iter().filter(|(k, _)| *k != 1 && *k != 9).cloned().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn randomized_against_oracle() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for &branching in &[4usize, 8, 32] {
            let mut tree = int_tree(branching);
            let mut oracle = BTreeMap::new();
            for _ in 0..2_000 {
                let key = rng.gen_range(0..500);
                if rng.gen_bool(0.6) {
                    tree.set(key, key, true);
                    oracle.insert(key, key);
                } else {
                    assert_eq!(tree.delete(&key), oracle.remove(&key));
                }
                assert_eq!(tree.len(), oracle.len());
            }
            let pairs = tree.pairs();
            let expected: Vec<(i64, i64)> = oracle.into_iter().collect();
            assert_eq!(pairs, expected);
        }
    }

    #[test]
    #[should_panic(expected = "unordered")]
    fn nan_key_fails_fast() {
        // A comparator that cannot place NaN anywhere leaves it unequal to
        // itself; inserting such a key must panic before touching the tree.
        let mut tree: Tree<f64, ()> = Tree::new(Rc::new(|a: &f64, b: &f64| {
            a.partial_cmp(b).unwrap_or(Ordering::Less)
        }));
        tree.set(f64::NAN, (), true);
    }
}
