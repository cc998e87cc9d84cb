//! Lock-free VNI pool
//!
//! One bit per identifier; allocation claims a bit with compare-exchange so
//! concurrent planners never hand out the same VNI twice.

use crate::error::{Result, SliceError};
use crate::models::Vni;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const DEFAULT_VNI_START: Vni = 1000;
pub const DEFAULT_VNI_END: Vni = 3000;

/// 24-bit VXLAN identifier space
const VNI_MAX: Vni = (1 << 24) - 1;

#[derive(Debug)]
pub struct VniPool {
    start: Vni,
    end: Vni,
    words: Vec<AtomicU64>,
    allocated: AtomicUsize,
}

impl VniPool {
    /// Pool covering `start..=end`
    pub fn new(start: Vni, end: Vni) -> Result<Self> {
        if start == 0 || start > end || end > VNI_MAX {
            return Err(SliceError::Configuration(format!(
                "invalid VNI range {}..={}",
                start, end
            )));
        }
        let size = (end - start + 1) as usize;
        let words = (0..size.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            start,
            end,
            words,
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn contains(&self, vni: Vni) -> bool {
        (self.start..=self.end).contains(&vni)
    }

    /// Claim the lowest free VNI
    pub fn allocate(&self) -> Result<Vni> {
        let capacity = self.capacity();
        for (index, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            loop {
                let free = !current & self.word_mask(index, capacity);
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros();
                let claimed = current | (1u64 << bit);
                match word.compare_exchange_weak(
                    current,
                    claimed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.allocated.fetch_add(1, Ordering::AcqRel);
                        return Ok(self.start + (index * 64) as Vni + bit);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        Err(SliceError::PoolExhausted { capacity })
    }

    /// Return a VNI; false if it was not allocated
    pub fn free(&self, vni: Vni) -> bool {
        if !self.contains(vni) {
            return false;
        }
        let offset = (vni - self.start) as usize;
        let mask = 1u64 << (offset % 64);
        let previous = self.words[offset / 64].fetch_and(!mask, Ordering::AcqRel);
        let was_set = previous & mask != 0;
        if was_set {
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
        was_set
    }

    pub fn is_allocated(&self, vni: Vni) -> bool {
        if !self.contains(vni) {
            return false;
        }
        let offset = (vni - self.start) as usize;
        self.words[offset / 64].load(Ordering::Acquire) & (1u64 << (offset % 64)) != 0
    }

    /// Valid bits of a word; the last word may be partial
    fn word_mask(&self, index: usize, capacity: usize) -> u64 {
        let remaining = capacity - index * 64;
        if remaining >= 64 {
            u64::MAX
        } else {
            (1u64 << remaining) - 1
        }
    }
}

impl Default for VniPool {
    fn default() -> Self {
        Self {
            start: DEFAULT_VNI_START,
            end: DEFAULT_VNI_END,
            words: (0..((DEFAULT_VNI_END - DEFAULT_VNI_START + 1) as usize).div_ceil(64))
                .map(|_| AtomicU64::new(0))
                .collect(),
            allocated: AtomicUsize::new(0),
        }
    }
}
