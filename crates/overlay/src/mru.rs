//! Recency tracking for resident overlays.
//!
//! A doubly linked list over overlay indices, most recent first. Node 0 is
//! the head sentinel and node `count + 1` the tail sentinel, so splicing
//! never special-cases an empty list. Membership is explicit: a node is in
//! the list exactly when its link is `Some`.

use core::ops::Range;

use crate::index::{OverlayIndex, MAX_OVERLAYS};

const NODES: usize = MAX_OVERLAYS + 2;
const HEAD: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: u8,
    next: u8,
}

/// MRU list for one memory class.
#[derive(Debug, Clone)]
pub struct MruList {
    links: [Option<Link>; NODES],
    tail: u8,
}

impl MruList {
    /// Empty list for a table of `count` overlays.
    #[must_use]
    #[allow(clippy::arithmetic_side_effects, clippy::indexing_slicing)] // Safety: tail <= MAX_OVERLAYS + 1
    #[allow(clippy::cast_possible_truncation)] // MAX_OVERLAYS fits u8
    pub fn new(count: u8) -> Self {
        let count = count.min(MAX_OVERLAYS as u8);
        let tail = count + 1;
        let mut links = [None; NODES];
        links[usize::from(HEAD)] = Some(Link { prev: HEAD, next: tail });
        links[usize::from(tail)] = Some(Link { prev: HEAD, next: tail });
        Self { links, tail }
    }

    fn link(&self, node: u8) -> Link {
        match self.links.get(usize::from(node)).copied().flatten() {
            Some(link) => link,
            None => halt!("MRU node {} unlinked", node),
        }
    }

    fn set(&mut self, node: u8, link: Link) {
        match self.links.get_mut(usize::from(node)) {
            Some(slot) => *slot = Some(link),
            None => halt!("MRU node {} out of range", node),
        }
    }

    fn checked(&self, ovl: OverlayIndex) -> u8 {
        if ovl.get() >= self.tail {
            halt!("overlay {} outside MRU list", ovl.get());
        }
        ovl.get()
    }

    /// `true` when `ovl` is linked.
    pub fn contains(&self, ovl: OverlayIndex) -> bool {
        ovl.get() < self.tail && self.links.get(usize::from(ovl.get())).is_some_and(Option::is_some)
    }

    /// Unlink `ovl`. Returns `false` if it was not in the list.
    pub fn remove(&mut self, ovl: OverlayIndex) -> bool {
        let node = self.checked(ovl);
        if !self.contains(ovl) {
            return false;
        }
        let Link { prev, next } = self.link(node);
        let mut before = self.link(prev);
        before.next = next;
        self.set(prev, before);
        let mut after = self.link(next);
        after.prev = prev;
        self.set(next, after);
        if let Some(slot) = self.links.get_mut(usize::from(node)) {
            *slot = None;
        }
        true
    }

    /// Link `ovl` right after the head, unlinking it first if present.
    pub fn push_front(&mut self, ovl: OverlayIndex) {
        let node = self.checked(ovl);
        self.remove(ovl);
        let first = self.link(HEAD).next;
        self.set(node, Link { prev: HEAD, next: first });
        let mut head = self.link(HEAD);
        head.next = node;
        self.set(HEAD, head);
        let mut after = self.link(first);
        after.prev = node;
        self.set(first, after);
    }

    /// Least recently used overlay.
    pub fn lru(&self) -> Option<OverlayIndex> {
        let last = self.link(self.tail).prev;
        if last == HEAD {
            None
        } else {
            OverlayIndex::new(last)
        }
    }

    /// Most recently used first.
    pub fn iter(&self) -> impl Iterator<Item = OverlayIndex> + '_ {
        let mut node = self.link(HEAD).next;
        core::iter::from_fn(move || {
            if node == self.tail {
                return None;
            }
            let current = node;
            node = self.link(node).next;
            OverlayIndex::new(current)
        })
    }

    /// Number of linked overlays.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// `true` when nothing is linked.
    pub fn is_empty(&self) -> bool {
        self.lru().is_none()
    }
}

/// Progress through the overlay currently being evicted.
///
/// Blocks are reclaimed from the back of `[tag_start, tag_end)` one at a
/// time; `do_not_recycle` names the overlay being loaded, which must never
/// become the candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecycleTracker {
    /// Overlay whose blocks are being reclaimed.
    pub candidate: Option<OverlayIndex>,
    /// First virtual tag not yet examined.
    pub tag_start: u32,
    /// One past the last virtual tag not yet examined.
    pub tag_end: u32,
    /// Overlay that must not be chosen as a candidate.
    pub do_not_recycle: Option<OverlayIndex>,
}

impl RecycleTracker {
    /// Begin reclaiming `span` of `ovl`.
    pub fn start(&mut self, ovl: OverlayIndex, span: Range<u32>) {
        self.candidate = Some(ovl);
        self.tag_start = span.start;
        self.tag_end = span.end;
    }

    /// Drop the current candidate.
    pub fn cancel(&mut self) {
        self.candidate = None;
        self.tag_start = 0;
        self.tag_end = 0;
    }

    /// `true` when no tag is left to examine.
    pub fn is_exhausted(&self) -> bool {
        self.tag_start >= self.tag_end
    }

    /// Take the last unexamined tag.
    pub fn pop_back(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.tag_end = self.tag_end.saturating_sub(1);
        Some(self.tag_end)
    }
}
