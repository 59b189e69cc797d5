//! # Ring Buffer
//!
//! Fixed-capacity history store.
//!
//! - `push` overwrites the oldest element when full and hands it back
//! - `pop` takes the most recent element (undo reads from the tail)
//! - `find*` scan in logical order, oldest → newest or newest → oldest
//! - `insert` places an element at a logical index, evicting the oldest when full
//! - `remove` excises an arbitrary element without disturbing the rest
//! - `scaling` grows in place or shrinks keeping the newest elements

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` elements
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    /// Append as newest; returns the evicted oldest element when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.is_full() {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Insert at logical index (0 = oldest); returns the evicted oldest element when full
    ///
    /// Inserting at index 0 of a full buffer hands `item` straight back.
    pub fn insert(&mut self, index: usize, item: T) -> Option<T> {
        let index = index.min(self.items.len());
        if !self.is_full() {
            self.items.insert(index, item);
            return None;
        }
        if index == 0 {
            return Some(item);
        }

        let evicted = self.items.pop_front();
        self.items.insert(index - 1, item);
        evicted
    }

    /// Remove and return the newest element
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_back()
    }

    /// Remove and return the oldest element
    pub fn shift(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Element at logical index (0 = oldest)
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest → newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        self.items.iter()
    }

    /// First match scanning oldest → newest
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<&T> {
        self.items.iter().find(|item| predicate(*item))
    }

    /// First match scanning newest → oldest
    pub fn find_last(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<&T> {
        self.items.iter().rev().find(|item| predicate(*item))
    }

    /// Logical index of the first match scanning oldest → newest
    pub fn find_index(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.items.iter().position(predicate)
    }

    /// Logical index of the first match scanning newest → oldest
    pub fn find_last_index(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.items.iter().rposition(predicate)
    }

    /// Remove the newest element matching `predicate`
    pub fn remove_where(&mut self, predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.find_last_index(predicate)?;
        self.items.remove(index)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Change the capacity; returns the elements dropped by shrinking, oldest first
    pub fn scaling(&mut self, new_capacity: usize) -> Vec<T> {
        let new_capacity = new_capacity.max(1);
        let overflow = self.items.len().saturating_sub(new_capacity);
        let dropped: Vec<T> = self.items.drain(..overflow).collect();

        self.capacity = new_capacity;
        if new_capacity > self.items.capacity() {
            self.items.reserve(new_capacity - self.items.len());
        } else {
            self.items.shrink_to(new_capacity);
        }

        dropped
    }
}

impl<T: PartialEq> RingBuffer<T> {
    /// Remove an element by equality, keeping the order of the rest
    pub fn remove(&mut self, item: &T) -> Option<T> {
        self.remove_where(|candidate| candidate == item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot in logical order
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
