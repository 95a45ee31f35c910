//! Any-device selection
//!
//! Plain rotation: the current device takes `uses_before_rotate` calls, then
//! the next one takes over. Devices that cannot take work are skipped. When
//! none can, the rotation candidate is returned anyway and the caller's
//! state check produces the error reply.

use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Rotation {
    current: usize,
    uses: u32,
}

#[derive(Debug)]
pub struct RoundRobin {
    uses_before_rotate: u32,
    rotation: Mutex<Rotation>,
}

impl RoundRobin {
    pub fn new(uses_before_rotate: u32) -> Self {
        Self {
            uses_before_rotate: uses_before_rotate.max(1),
            rotation: Mutex::new(Rotation::default()),
        }
    }

    /// Pick one of `device_count` devices; `None` only when there are none
    pub fn pick(&self, device_count: usize, available: impl Fn(usize) -> bool) -> Option<usize> {
        if device_count == 0 {
            return None;
        }

        let mut rotation = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        rotation.current %= device_count;

        if rotation.uses >= self.uses_before_rotate {
            rotation.current = (rotation.current + 1) % device_count;
            rotation.uses = 0;
        }

        for step in 0..device_count {
            let index = (rotation.current + step) % device_count;
            if available(index) {
                if step > 0 {
                    rotation.current = index;
                    rotation.uses = 0;
                }
                rotation.uses += 1;
                return Some(index);
            }
        }

        rotation.uses += 1;
        Some(rotation.current)
    }
}
