//! Arena allocator and offline memory planner.
//!
//! The interpreter owns one contiguous buffer, sized by the caller and
//! reserved once when tensors are allocated. Planning carves a single high-water-mark region out of
//! it; invoke never allocates.

use std::ops::Range;

use crate::error::AllocationError;

/// Alignment of the arena base and of every planned buffer.
pub const ARENA_ALIGN: usize = 16;

/// A forward-only bump arena over a single heap buffer.
///
/// Offsets are relative to an [`ARENA_ALIGN`]-aligned base. Every view of
/// the buffer, including pointers handed across the C ABI, derives from the
/// one base pointer taken at construction.
pub struct Arena {
    // Owns the allocation; never touched again after `base` is taken.
    _buf: Vec<u8>,
    base: *mut u8,
    capacity: usize,
    offset: usize,
}

// The arena owns its buffer outright; `base` is never shared outside
// borrows of `self`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve an arena with the given capacity in bytes.
    ///
    /// Fails instead of aborting when the buffer cannot be reserved.
    pub fn new(capacity: usize) -> Result<Self, AllocationError> {
        let oom = AllocationError::OutOfMemory { requested: capacity };
        let len = capacity
            .checked_add(ARENA_ALIGN - 1)
            .filter(|&len| len <= isize::MAX as usize)
            .ok_or(oom.clone())?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| oom)?;
        buf.resize(len, 0u8);
        let pad = match buf.as_ptr().align_offset(ARENA_ALIGN) {
            off if off < ARENA_ALIGN => off,
            _ => 0,
        };
        // SAFETY: pad < ARENA_ALIGN <= len, so the base stays inside the buffer.
        let base = unsafe { buf.as_mut_ptr().add(pad) };
        Ok(Self { _buf: buf, base, capacity, offset: 0 })
    }

    /// Carve `nbytes` at the next aligned offset.
    pub fn alloc(&mut self, nbytes: usize) -> Result<Range<usize>, AllocationError> {
        let start = align_up(self.offset, ARENA_ALIGN);
        let end = start.checked_add(nbytes).filter(|&end| end <= self.capacity);
        match end {
            Some(end) => {
                self.offset = end;
                Ok(start..end)
            }
            None => Err(AllocationError::Exhausted {
                requested: nbytes,
                available: self.capacity.saturating_sub(start),
            }),
        }
    }

    /// Forget every allocation. Contents are left as they are.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Current bytes used.
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining bytes available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    fn in_bounds(&self, range: &Range<usize>) -> bool {
        range.start <= range.end && range.end <= self.capacity
    }

    pub fn bytes(&self, range: Range<usize>) -> Option<&[u8]> {
        if !self.in_bounds(&range) {
            return None;
        }
        // SAFETY: the range lies inside the initialized buffer owned by self.
        Some(unsafe { std::slice::from_raw_parts(self.base.add(range.start), range.len()) })
    }

    pub fn bytes_mut(&mut self, range: Range<usize>) -> Option<&mut [u8]> {
        if !self.in_bounds(&range) {
            return None;
        }
        // SAFETY: as in `bytes`, and `&mut self` rules out other views.
        Some(unsafe { std::slice::from_raw_parts_mut(self.base.add(range.start), range.len()) })
    }

    /// The whole aligned region, allocated or not.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `capacity` bytes from `base` are initialized and owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.capacity) }
    }

    /// Raw pointer to `range`, stable for the arena's lifetime.
    ///
    /// Writes through it are only sound while no Rust borrow of the same
    /// bytes is alive.
    pub(crate) fn raw_ptr(&self, range: Range<usize>) -> Option<*mut u8> {
        // SAFETY: the offset is within the buffer.
        self.in_bounds(&range).then(|| unsafe { self.base.add(range.start) })
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.offset)
            .finish()
    }
}

/// Rounds `n` up to `align`, saturating at the largest aligned value.
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    n.saturating_add(align - 1) & !(align - 1)
}

/// One buffer to place: `size` bytes live from step `first_use` through
/// step `last_use`, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub size: usize,
    pub first_use: usize,
    pub last_use: usize,
}

impl BufferRequest {
    fn overlaps_in_time(&self, other: &BufferRequest) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// Greedy offline placement of buffers with known live ranges.
///
/// Buffers are placed largest first, each at the lowest aligned offset that
/// does not collide with an already-placed buffer whose live range overlaps.
/// Buffers with disjoint live ranges share memory.
#[derive(Debug, Default)]
pub struct GreedyMemoryPlanner {
    requests: Vec<BufferRequest>,
    offsets: Vec<usize>,
    high_water_mark: usize,
}

impl GreedyMemoryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer, returning its id. Invalidates any previous plan.
    pub fn add_buffer(&mut self, size: usize, first_use: usize, last_use: usize) -> usize {
        self.requests.push(BufferRequest { size, first_use, last_use: last_use.max(first_use) });
        self.offsets.clear();
        self.high_water_mark = 0;
        self.requests.len() - 1
    }

    pub fn num_buffers(&self) -> usize {
        self.requests.len()
    }

    pub fn request(&self, id: usize) -> Option<&BufferRequest> {
        self.requests.get(id)
    }

    /// Place every buffer and return the high-water mark, saturating at
    /// `usize::MAX` so an impossible layout fails allocation instead.
    pub fn plan(&mut self) -> usize {
        let mut order: Vec<usize> = (0..self.requests.len()).collect();
        order.sort_by(|&a, &b| self.requests[b].size.cmp(&self.requests[a].size).then(a.cmp(&b)));

        let mut offsets = vec![0usize; self.requests.len()];
        let mut placed: Vec<usize> = Vec::with_capacity(order.len());
        let mut high_water = 0;

        for &id in &order {
            let req = self.requests[id];
            if req.size == 0 {
                continue;
            }
            let mut conflicts: Vec<(usize, usize)> = placed
                .iter()
                .filter(|&&p| self.requests[p].overlaps_in_time(&req))
                .map(|&p| (offsets[p], offsets[p].saturating_add(self.requests[p].size)))
                .collect();
            conflicts.sort_unstable();

            let mut candidate: usize = 0;
            for (start, end) in conflicts {
                if candidate.saturating_add(req.size) <= start {
                    break;
                }
                candidate = candidate.max(align_up(end, ARENA_ALIGN));
            }
            offsets[id] = candidate;
            high_water = high_water.max(candidate.saturating_add(req.size));
            placed.push(id);
        }

        self.offsets = offsets;
        self.high_water_mark = high_water;
        high_water
    }

    /// Planned offset of buffer `id`; `None` before [`plan`](Self::plan).
    pub fn offset(&self, id: usize) -> Option<usize> {
        self.offsets.get(id).copied()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Bytes of all buffers live at `step`.
    pub fn live_bytes_at(&self, step: usize) -> usize {
        self.requests
            .iter()
            .filter(|r| r.first_use <= step && step <= r.last_use)
            .fold(0usize, |acc, r| acc.saturating_add(r.size))
    }
}
