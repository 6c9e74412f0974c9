//! Circular queue index arithmetic.
//!
//! Head and tail indices carry a wrap bit above the real position. The wrap
//! bit flips every time an index laps the queue, which lets `head == tail`
//! mean "empty" and `head == tail ^ WRAP_BIT` mean "full" without wasting a
//! slot.

/// Bit toggled each time an index passes the end of the queue.
pub const WRAP_BIT: u32 = 1 << 10;

/// Mask selecting the real position from an index.
pub const INDEX_MASK: u32 = WRAP_BIT - 1;

/// Largest capacity a queue can be programmed with.
pub const MAX_QUEUE_SIZE: u32 = WRAP_BIT - 1;

/// Returns the slot position of `index` with the wrap bit stripped.
#[inline]
pub const fn real_index(index: u32) -> u32 {
    index & INDEX_MASK
}

/// Returns true if the wrap bit of `index` is set.
#[inline]
pub const fn is_wrapped(index: u32) -> bool {
    index & WRAP_BIT != 0
}

/// Number of populated slots between `head` and `tail`.
///
/// The result is always in `[0, capacity]`. Indices that could not have been
/// produced by [`advance`] (for example a corrupted register value) are
/// clamped rather than trusted.
#[inline]
pub fn occupancy(head: u32, tail: u32, capacity: u32) -> u32 {
    let (head_pos, tail_pos) = (real_index(head), real_index(tail));
    let count = if is_wrapped(head) != is_wrapped(tail) {
        capacity.wrapping_sub(head_pos).wrapping_add(tail_pos)
    } else {
        tail_pos.wrapping_sub(head_pos)
    };
    count.min(capacity)
}

/// Returns `index` moved forward by `delta` slots.
///
/// The wrap bit toggles exactly when the real position reaches `capacity`.
/// Callers must reject `delta > capacity` before calling.
#[inline]
pub fn advance(index: u32, delta: u32, capacity: u32) -> u32 {
    debug_assert!(delta <= capacity, "advance by {delta} exceeds capacity {capacity}");
    let wrap = index & WRAP_BIT;
    let pos = real_index(index) + delta;
    if pos >= capacity {
        (pos - capacity) | (wrap ^ WRAP_BIT)
    } else {
        pos | wrap
    }
}

/// Returns true if a queue with these indices has no free slot.
#[inline]
pub fn is_full(head: u32, tail: u32, capacity: u32) -> bool {
    occupancy(head, tail, capacity) >= capacity
}
