//! Blocks handed out behind the tracer's back.
//!
//! While a thread is inside the tracer, libc may allocate on its behalf (TLS
//! destructor registration when the tracer lock parks, `dlsym` error
//! buffers). Those nested calls bypass the ledger, and so do copies made out
//! of the bootstrap arena. The program can still free such a block through
//! the exported `free`, so the address is remembered here and later frees are
//! forwarded without being classified.
//!
//! The table is a fixed array of atomic slots searched linearly from a hash of
//! the address. It never allocates and never blocks, so it is safe to use on
//! the reentrant path.

use std::sync::atomic::{AtomicUsize, Ordering};

const SLOTS: usize = 4096;
/// Longest search run for a single address.
const MAX_RUN: usize = 64;

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

static TABLE: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(EMPTY) }; SLOTS];
static LIVE: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn home(address: usize) -> usize {
    let h = (address >> 4) ^ (address >> 16);
    h % SLOTS
}

#[inline]
fn run(address: usize) -> impl Iterator<Item = &'static AtomicUsize> {
    let start = home(address);
    (0..MAX_RUN).map(move |i| &TABLE[(start + i) % SLOTS])
}

/// Remember `address` as an untracked block. Returns false when the search
/// window is full; the block is then reported like any unknown address.
pub fn remember(address: usize) -> bool {
    if address == EMPTY || address == TOMBSTONE {
        return false;
    }
    for _ in 0..4 {
        let mut free_slot = None;
        for slot in run(address) {
            match slot.load(Ordering::Acquire) {
                v if v == address => return true,
                EMPTY => {
                    free_slot.get_or_insert(slot);
                    break;
                }
                TOMBSTONE => {
                    free_slot.get_or_insert(slot);
                }
                _ => {}
            }
        }
        let Some(slot) = free_slot else {
            return false;
        };
        let current = slot.load(Ordering::Acquire);
        if (current == EMPTY || current == TOMBSTONE)
            && slot
                .compare_exchange(current, address, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            LIVE.fetch_add(1, Ordering::AcqRel);
            return true;
        }
    }
    false
}

/// Drop every entry for `address`. Returns whether it was untracked.
pub fn forget(address: usize) -> bool {
    if LIVE.load(Ordering::Acquire) == 0 || address == EMPTY || address == TOMBSTONE {
        return false;
    }
    let mut found = false;
    for slot in run(address) {
        match slot.load(Ordering::Acquire) {
            EMPTY => break,
            v if v == address => {
                if slot
                    .compare_exchange(address, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    LIVE.fetch_sub(1, Ordering::AcqRel);
                    found = true;
                }
            }
            _ => {}
        }
    }
    found
}

/// Whether `address` is currently remembered.
#[must_use]
pub fn contains(address: usize) -> bool {
    if LIVE.load(Ordering::Acquire) == 0 {
        return false;
    }
    for slot in run(address) {
        match slot.load(Ordering::Acquire) {
            EMPTY => return false,
            v if v == address => return true,
            _ => {}
        }
    }
    false
}
