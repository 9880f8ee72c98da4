//! A fixed-capacity pool of reusable frame buffers.
//!
//! Every frame that enters the pipeline is copied into a [FrameSlot] leased
//! from a [FramePool]. The lease is an RAII handle: when a [SlotLease] is
//! dropped, wherever that happens (a finished job, a cancelled job, a
//! disposed queue), the slot goes back to its pool. Because the lease owns
//! the slot, a slot is returned exactly once.

use crate::sensor::{SensorFormat, SensorFrame};
use log::debug;
use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Reusable buffers for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSlot {
    /// Raw depth in millimetres
    pub depth: Vec<u16>,
    /// BGRA color mapped to depth space
    pub color: Vec<u8>,
    /// Sequence number of the frame currently held
    pub frame_number: u64,
    /// Format this slot was allocated for
    pub format: SensorFormat,
}

impl FrameSlot {
    /// Allocate buffers sized for `format`.
    pub fn allocate(format: SensorFormat) -> Self {
        let pixels = format.depth.pixel_count();
        Self {
            depth: vec![0; pixels],
            color: vec![0; pixels * 4],
            frame_number: 0,
            format,
        }
    }

    /// Copy a frame's pixels into this slot without reallocating.
    pub fn fill_from(&mut self, frame: &SensorFrame) -> Result<(), PoolError> {
        if frame.format != self.format
            || frame.depth.len() != self.depth.len()
            || frame.color.len() != self.color.len()
        {
            return Err(PoolError::FormatMismatch);
        }
        self.depth.copy_from_slice(&frame.depth);
        self.color.copy_from_slice(&frame.color);
        self.frame_number = frame.frame_number;
        Ok(())
    }

    /// Copy another slot's pixels into this one, as when a frame moves from
    /// one pool tier to the next.
    pub fn copy_from(&mut self, other: &FrameSlot) -> Result<(), PoolError> {
        if other.format != self.format {
            return Err(PoolError::FormatMismatch);
        }
        self.depth.copy_from_slice(&other.depth);
        self.color.copy_from_slice(&other.color);
        self.frame_number = other.frame_number;
        Ok(())
    }
}

/// Things that can go wrong when using a [FramePool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is leased out; the caller should drop the frame
    Exhausted,
    /// The format cannot change while slots are leased
    SlotsOutstanding(usize),
    /// The data does not match the slot's format
    FormatMismatch,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "frame pool exhausted"),
            PoolError::SlotsOutstanding(n) => {
                write!(f, "cannot change format with {} slots outstanding", n)
            }
            PoolError::FormatMismatch => write!(f, "frame does not match the pool format"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug)]
struct PoolState {
    idle: Vec<FrameSlot>,
    outstanding: usize,
    format: SensorFormat,
}

/// A fixed set of [FrameSlot]s that are handed out and returned.
///
/// Cloning a `FramePool` produces another handle to the same slots.
#[derive(Debug, Clone)]
pub struct FramePool {
    name: &'static str,
    capacity: usize,
    state: Arc<Mutex<PoolState>>,
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FramePool {
    /// Instantiate a pool of `capacity` slots for `format`.
    pub fn new(name: &'static str, capacity: usize, format: SensorFormat) -> Self {
        let idle = (0..capacity).map(|_| FrameSlot::allocate(format)).collect();
        Self {
            name,
            capacity,
            state: Arc::new(Mutex::new(PoolState {
                idle,
                outstanding: 0,
                format,
            })),
        }
    }

    /// Lease a slot. Never blocks; returns [PoolError::Exhausted] when every
    /// slot is already leased.
    pub fn acquire(&self) -> Result<SlotLease, PoolError> {
        let mut state = lock(&self.state);
        match state.idle.pop() {
            Some(slot) => {
                state.outstanding += 1;
                Ok(SlotLease {
                    slot: Some(slot),
                    pool: Arc::clone(&self.state),
                })
            }
            None => {
                debug!("{} : exhausted ({} outstanding).", self.name, state.outstanding);
                Err(PoolError::Exhausted)
            }
        }
    }

    /// Give a slot back. Equivalent to dropping the lease.
    pub fn release(&self, lease: SlotLease) {
        drop(lease);
    }

    /// Reallocate every slot for a new format. Fails if any slot is leased,
    /// since a job holding it would still reference the old format.
    pub fn set_format(&self, format: SensorFormat) -> Result<(), PoolError> {
        let mut state = lock(&self.state);
        if state.outstanding > 0 {
            return Err(PoolError::SlotsOutstanding(state.outstanding));
        }
        if state.format != format {
            state.idle = (0..self.capacity)
                .map(|_| FrameSlot::allocate(format))
                .collect();
            state.format = format;
            debug!("{} : reallocated for {:?}.", self.name, format);
        }
        Ok(())
    }

    /// Number of slots currently leased.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).outstanding
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Format the slots are currently sized for.
    pub fn format(&self) -> SensorFormat {
        lock(&self.state).format
    }
}

/// A leased [FrameSlot]. Returns the slot to its pool when dropped.
#[derive(Debug)]
pub struct SlotLease {
    slot: Option<FrameSlot>,
    pool: Arc<Mutex<PoolState>>,
}

impl Deref for SlotLease {
    type Target = FrameSlot;

    fn deref(&self) -> &FrameSlot {
        self.slot.as_ref().expect("slot is only taken on drop")
    }
}

impl DerefMut for SlotLease {
    fn deref_mut(&mut self) -> &mut FrameSlot {
        self.slot.as_mut().expect("slot is only taken on drop")
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let mut state = lock(&self.pool);
            state.outstanding -= 1;
            if slot.format == state.format {
                state.idle.push(slot);
            } else {
                let format = state.format;
                state.idle.push(FrameSlot::allocate(format));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Resolution;

    fn tiny_format() -> SensorFormat {
        SensorFormat {
            depth: Resolution::new(4, 3),
            color: Resolution::new(4, 3),
            skeleton_count: 1,
        }
    }

    #[test]
    fn sixth_acquire_reports_exhaustion() {
        let pool = FramePool::new("TestPool", 5, tiny_format());
        let leases: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();

        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted);
        assert_eq!(pool.outstanding(), 5);

        drop(leases);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn slots_match_format() {
        let pool = FramePool::new("TestPool", 2, tiny_format());
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.depth.len(), 12);
        assert_eq!(lease.color.len(), 48);
    }

    #[test]
    fn format_change_refused_while_leased() {
        let pool = FramePool::new("TestPool", 2, tiny_format());
        let lease = pool.acquire().unwrap();

        assert_eq!(
            pool.set_format(SensorFormat::vga()),
            Err(PoolError::SlotsOutstanding(1))
        );

        pool.release(lease);
        assert!(pool.set_format(SensorFormat::vga()).is_ok());
        let lease = pool.acquire().unwrap();
        assert_eq!(lease.depth.len(), 640 * 480);
    }

    #[test]
    fn fill_from_rejects_wrong_size() {
        let pool = FramePool::new("TestPool", 1, tiny_format());
        let mut lease = pool.acquire().unwrap();
        let frame = SensorFrame {
            frame_number: 3,
            depth: vec![500; 12],
            color: vec![9; 48],
            skeletons: vec![],
            format: tiny_format(),
        };

        assert!(lease.fill_from(&frame).is_ok());
        assert_eq!(lease.frame_number, 3);
        assert_eq!(lease.depth[11], 500);

        let wrong = SensorFrame {
            depth: vec![500; 10],
            ..frame
        };
        assert_eq!(lease.fill_from(&wrong), Err(PoolError::FormatMismatch));
    }

    #[test]
    fn leases_return_from_other_threads() {
        let pool = FramePool::new("TestPool", 3, tiny_format());
        let leases: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();

        std::thread::spawn(move || drop(leases)).join().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }
}
