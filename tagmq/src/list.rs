//! Index-linked FIFO lists over a slab arena.
//!
//! Nodes live in a `Slab` and refer to each other by slab key, so unlinking
//! a found node is O(1) and moving a node between lists never reallocates it.
//! A node belongs to at most one list at a time.

use slab::Slab;

/// Intrusive prev/next links stored in each node.
#[derive(Debug, Clone, Copy, Default)]
pub struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

impl Links {
    /// Key of the following node.
    #[inline]
    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

/// Access to a node's links.
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Head of one list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl ListHead {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Append `idx` at the tail.
    pub fn push_back<T: Linked>(&mut self, arena: &mut Slab<T>, idx: usize) {
        self.insert_before(arena, None, idx);
    }

    /// Link `idx` in front of `at`, or at the tail when `at` is `None`.
    pub fn insert_before<T: Linked>(&mut self, arena: &mut Slab<T>, at: Option<usize>, idx: usize) {
        let prev = match at {
            Some(at) => arena[at].links().prev,
            None => self.tail,
        };
        *arena[idx].links_mut() = Links { prev, next: at };
        match prev {
            Some(p) => arena[p].links_mut().next = Some(idx),
            None => self.head = Some(idx),
        }
        match at {
            Some(n) => arena[n].links_mut().prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
    }

    /// Unlink `idx`, which must be on this list. The node stays in the arena.
    pub fn unlink<T: Linked>(&mut self, arena: &mut Slab<T>, idx: usize) {
        let Links { prev, next } = *arena[idx].links();
        match prev {
            Some(p) => arena[p].links_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => arena[n].links_mut().prev = prev,
            None => self.tail = prev,
        }
        *arena[idx].links_mut() = Links::default();
        self.len -= 1;
    }

    /// First node, in list order, for which `pred` holds.
    pub fn find<T: Linked>(&self, arena: &Slab<T>, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = &arena[idx];
            if pred(node) {
                return Some(idx);
            }
            cur = node.links().next;
        }
        None
    }

    /// Iterate slab keys in list order.
    pub fn iter<'a, T: Linked>(&self, arena: &'a Slab<T>) -> ListIter<'a, T> {
        ListIter {
            arena,
            cur: self.head,
        }
    }

    /// Unlink every node, returning their keys in list order.
    pub fn take_all<T: Linked>(&mut self, arena: &mut Slab<T>) -> Vec<usize> {
        let keys: Vec<usize> = self.iter(arena).collect();
        for &idx in &keys {
            *arena[idx].links_mut() = Links::default();
        }
        *self = ListHead::new();
        keys
    }
}

/// Iterator over the slab keys of a list.
pub struct ListIter<'a, T> {
    arena: &'a Slab<T>,
    cur: Option<usize>,
}

impl<T: Linked> Iterator for ListIter<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cur?;
        self.cur = self.arena[idx].links().next;
        Some(idx)
    }
}
