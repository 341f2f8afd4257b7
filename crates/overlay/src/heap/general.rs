//! First-fit free-list heap with coalescing.
//!
//! Manages one byte arena (the general heap overlay). All offsets below are
//! arena-relative and multiples of [`GRANULE`]; addresses handed to callers
//! are `base + offset`.
//!
//! # Layout
//!
//! ```text
//! arena:  [head 8][ free / allocated blocks ... ][tail 8]
//!
//! free block:       [size u32][next u32] ..........................
//! allocated block:  [waste ...][size u32][waste u32][user ...][.. sig u32]
//!                              └─── header ────────┘ ▲ returned pointer
//! ```
//!
//! `size` is the whole block including header, alignment waste and the
//! trailing signature slot. The signature sits in the last word of the
//! block; it is checked and cleared by `free`, which also catches double
//! frees. The free list is kept in address order so neighbours coalesce.

use platform::Scheduler;

/// Allocation granularity and block alignment.
pub const GRANULE: u32 = 8;

const HEADER: u32 = 8;
const SIG_SLOT: u32 = 8;
const SIGNATURE: u32 = 0xA110_CA7E;
const HEAD: u32 = 0;
const NONE: u32 = u32::MAX;

/// Smallest block worth keeping on the free list: a header, one granule of
/// payload and the signature slot.
pub const MIN_BLOCK: u32 = HEADER + GRANULE + SIG_SLOT;

/// Smallest arena [`GeneralHeap::init`] accepts.
pub const MIN_ARENA: u32 = HEADER + MIN_BLOCK + HEADER;

/// The general-purpose DMEM heap.
pub struct GeneralHeap<'a> {
    arena: &'a mut [u8],
    base: u32,
    max_align: u32,
}

impl<'a> GeneralHeap<'a> {
    /// Take over `arena`, which lives at address `base`. Alignments above
    /// `max_align` (one physical block) are refused.
    ///
    /// Halts when `base` or the arena length is not granule-aligned, or the
    /// arena cannot hold a single allocation.
    pub fn init(arena: &'a mut [u8], base: u32, max_align: u32) -> Self {
        let len = match u32::try_from(arena.len()) {
            Ok(len) if len % GRANULE == 0 && base % GRANULE == 0 => len,
            _ => halt!("heap arena at {} not granule aligned", base),
        };
        if len < MIN_ARENA || base.checked_add(len).is_none() {
            halt!("heap arena of {} bytes too small", len);
        }
        let mut heap = Self {
            arena,
            base,
            max_align,
        };
        #[allow(clippy::arithmetic_side_effects)] // Safety: len >= MIN_ARENA
        let (tail, body) = (len - HEADER, len - 2 * HEADER);
        heap.set_node(HEAD, 0, HEADER);
        heap.set_node(HEADER, body, NONE);
        heap.set_node(tail, 0, NONE);
        info!("general heap: {} bytes at {}", body, base);
        heap
    }

    /// Address of the first arena byte.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Allocate `size` bytes at granule alignment.
    pub fn alloc<S: Scheduler>(&mut self, sched: &mut S, size: u32) -> Option<u32> {
        self.alloc_aligned(sched, size, GRANULE)
    }

    /// Allocate `size` bytes at a multiple of `align`.
    ///
    /// Returns `None` for a zero size, an alignment that is not a power of
    /// two or exceeds one block, or when no free block fits.
    pub fn alloc_aligned<S: Scheduler>(
        &mut self,
        sched: &mut S,
        size: u32,
        align: u32,
    ) -> Option<u32> {
        if size == 0 || !align.is_power_of_two() || align > self.max_align {
            return None;
        }
        let align = align.max(GRANULE);
        let payload = size.checked_add(GRANULE - 1)? & !(GRANULE - 1);
        let need = payload.checked_add(HEADER + SIG_SLOT)?;

        sched.suspend_all();
        let found = self.first_fit(need, align);
        let ptr = found.map(|fit| self.carve(fit, need));
        sched.resume_all();

        match ptr {
            Some(ptr) => trace!("heap alloc {} at {}", size, ptr),
            None => warn!("heap alloc of {} (align {}) failed", size, align),
        }
        ptr
    }

    /// Return an allocation. Halts on a pointer this heap did not hand out,
    /// a corrupted header or signature, or a double free.
    pub fn free<S: Scheduler>(&mut self, sched: &mut S, ptr: u32) {
        let (start, size) = self.validate(ptr);
        sched.suspend_all();
        self.set_word(start.saturating_add(size).saturating_sub(4), 0);
        self.insert_free(start, size);
        sched.resume_all();
        trace!("heap free {}", ptr);
    }

    /// Reserved for a higher-trust allocation class. Halts.
    pub fn alloc_secure<S: Scheduler>(&mut self, _sched: &mut S, size: u32, _align: u32) -> u32 {
        halt!("secure heap allocation of {} unsupported", size)
    }

    /// Reserved for a higher-trust allocation class. Halts.
    pub fn free_secure<S: Scheduler>(&mut self, _sched: &mut S, ptr: u32) {
        halt!("secure heap free of {} unsupported", ptr)
    }

    /// Total bytes on the free list, headers included.
    pub fn free_bytes(&self) -> u32 {
        self.free_nodes().map(|(_, size)| size).fold(0, u32::saturating_add)
    }

    /// Size of the largest free block, headers included.
    pub fn largest_free_block(&self) -> u32 {
        self.free_nodes().map(|(_, size)| size).max().unwrap_or(0)
    }

    /// `len` bytes at address `addr`, if inside the arena.
    pub fn bytes(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let range = self.range(addr, len)?;
        self.arena.get(range)
    }

    /// Mutable `len` bytes at address `addr`, if inside the arena.
    pub fn bytes_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        let range = self.range(addr, len)?;
        self.arena.get_mut(range)
    }

    // ── Free list ───────────────────────────────────────────────────────────

    fn free_nodes(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut cur = self.next(HEAD);
        core::iter::from_fn(move || {
            if cur == NONE {
                return None;
            }
            let node = (cur, self.size(cur));
            cur = self.next(cur);
            Some(node)
        })
    }

    /// First free block that can hold `need` bytes with the user pointer
    /// aligned to `align`.
    fn first_fit(&self, need: u32, align: u32) -> Option<Fit> {
        let mut prev = HEAD;
        let mut cur = self.next(HEAD);
        while cur != NONE {
            let size = self.size(cur);
            if let Some(waste) = self.waste_for(cur, align) {
                if waste.checked_add(need).is_some_and(|total| total <= size) {
                    return Some(Fit {
                        prev,
                        node: cur,
                        size,
                        waste,
                    });
                }
            }
            prev = cur;
            cur = self.next(cur);
        }
        None
    }

    /// Bytes skipped in front of the header so the user pointer of a block
    /// at `node` is aligned.
    fn waste_for(&self, node: u32, align: u32) -> Option<u32> {
        let user = self.base.checked_add(node)?.checked_add(HEADER)?;
        let aligned = user.checked_add(align - 1)? & !(align - 1);
        aligned.checked_sub(user)
    }

    /// Turn `fit` into an allocated block of `need` bytes, splitting off
    /// leading waste and trailing slack when they can stand as free blocks.
    #[allow(clippy::arithmetic_side_effects)] // Safety: waste + need <= fit.size, all inside the arena
    fn carve(&mut self, fit: Fit, need: u32) -> u32 {
        let Fit {
            mut prev,
            mut node,
            mut size,
            mut waste,
        } = fit;
        let next = self.next(node);

        if waste >= MIN_BLOCK {
            // Leading waste stays on the list as its own free block.
            self.set_node(node, waste, next);
            prev = node;
            node += waste;
            size -= waste;
            waste = 0;
        }

        let used = waste + need;
        let block = if size - used >= MIN_BLOCK {
            let rest = node + used;
            self.set_node(rest, size - used, next);
            self.set_next(prev, rest);
            used
        } else {
            self.set_next(prev, next);
            size
        };

        let header = node + waste;
        self.set_word(header, block);
        self.set_word(header + 4, waste);
        self.set_word(node + block - 4, SIGNATURE);
        self.base + header + HEADER
    }

    /// Check a pointer's header and signature; return the block's offset
    /// and size.
    fn validate(&self, ptr: u32) -> (u32, u32) {
        let header = ptr
            .checked_sub(self.base)
            .and_then(|off| off.checked_sub(HEADER))
            .filter(|off| *off >= HEADER && *off % GRANULE == 0);
        let Some(header) = header else {
            halt!("heap free of foreign pointer {}", ptr);
        };
        let size = self.word(header);
        let waste = self.word(header.saturating_add(4));
        if waste % GRANULE != 0 || waste >= self.max_align.max(GRANULE) {
            halt!("heap header at {} corrupt: waste {}", ptr, waste);
        }
        let Some(start) = header.checked_sub(waste).filter(|s| *s >= HEADER) else {
            halt!("heap header at {} corrupt: waste {}", ptr, waste);
        };
        let tail = self.tail();
        let in_bounds = size >= MIN_BLOCK
            && size % GRANULE == 0
            && start.checked_add(size).is_some_and(|end| end <= tail);
        if !in_bounds {
            halt!("heap header at {} corrupt: size {}", ptr, size);
        }
        #[allow(clippy::arithmetic_side_effects)] // Safety: start + size <= tail
        let sig = self.word(start + size - 4);
        if sig != SIGNATURE {
            halt!("heap signature at {} broken (double free or overrun)", ptr);
        }
        (start, size)
    }

    /// Put `[start, start + size)` back on the address-ordered list,
    /// merging with adjacent free neighbours.
    #[allow(clippy::arithmetic_side_effects)] // Safety: offsets bounded by the arena length
    fn insert_free(&mut self, start: u32, size: u32) {
        let mut prev = HEAD;
        let mut cur = self.next(HEAD);
        while cur != NONE && cur < start {
            prev = cur;
            cur = self.next(cur);
        }
        let prev_end = if prev == HEAD { HEADER } else { prev + self.size(prev) };
        let end = start + size;
        if prev_end > start || (cur != NONE && end > cur) {
            halt!("heap free of {} overlaps a free block", self.base + start);
        }

        let node = if prev != HEAD && prev_end == start {
            self.set_size(prev, self.size(prev) + size);
            prev
        } else {
            self.set_node(start, size, cur);
            self.set_next(prev, start);
            start
        };
        if cur != NONE && node + self.size(node) == cur {
            let merged = self.size(node) + self.size(cur);
            let after = self.next(cur);
            self.set_node(node, merged, after);
        }
    }

    // ── Raw access ──────────────────────────────────────────────────────────

    #[allow(clippy::cast_possible_truncation)] // arena length checked in init
    fn tail(&self) -> u32 {
        (self.arena.len() as u32).saturating_sub(HEADER)
    }

    fn range(&self, addr: u32, len: u32) -> Option<core::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        Some(start..end)
    }

    fn word(&self, off: u32) -> u32 {
        let bytes = usize::try_from(off)
            .ok()
            .and_then(|o| self.arena.get(o..o.checked_add(4)?))
            .and_then(|b| <[u8; 4]>::try_from(b).ok());
        match bytes {
            Some(b) => u32::from_le_bytes(b),
            None => halt!("heap access at offset {} outside arena", off),
        }
    }

    fn set_word(&mut self, off: u32, value: u32) {
        let slot = usize::try_from(off)
            .ok()
            .and_then(|o| self.arena.get_mut(o..o.checked_add(4)?));
        match slot {
            Some(slot) => slot.copy_from_slice(&value.to_le_bytes()),
            None => halt!("heap access at offset {} outside arena", off),
        }
    }

    fn size(&self, node: u32) -> u32 {
        self.word(node)
    }

    fn next(&self, node: u32) -> u32 {
        self.word(node.saturating_add(4))
    }

    fn set_size(&mut self, node: u32, size: u32) {
        self.set_word(node, size);
    }

    fn set_next(&mut self, node: u32, next: u32) {
        self.set_word(node.saturating_add(4), next);
    }

    fn set_node(&mut self, node: u32, size: u32, next: u32) {
        self.set_size(node, size);
        self.set_next(node, next);
    }
}

/// A free block chosen by [`GeneralHeap::first_fit`].
#[derive(Clone, Copy)]
struct Fit {
    prev: u32,
    node: u32,
    size: u32,
    waste: u32,
}
