//! Operational state of one alpha device

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use serde::Serialize;

use crate::protocol::HalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum DeviceState {
    Locked = 0,
    Ready = 1,
    KeyGenBusy = 2,
    Busy = 3,
    NotReady = 4,
    Failed = 5,
    Tamper = 6,
    TamperReset = 7,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::KeyGenBusy,
            3 => Self::Busy,
            4 => Self::NotReady,
            5 => Self::Failed,
            6 => Self::Tamper,
            7 => Self::TamperReset,
            _ => Self::Locked,
        }
    }

    /// Operator-facing description, also returned by GET_HSM_STATE
    pub fn description(self) -> &'static str {
        match self {
            Self::Locked => "The HSM must be unlocked. Please login using the setup console.",
            Self::Ready => "Active - Ready",
            Self::KeyGenBusy => "Active - Generating a key",
            Self::Busy => "Active - Busy",
            Self::NotReady => "Device not ready",
            Self::Failed => "Device failure. Try restarting the HSM.",
            Self::Tamper => "ERROR - Tamper detected",
            Self::TamperReset => {
                "WARNING - A tamper event has stopped. Please check the HSM and restart it."
            }
        }
    }

    /// Status a request gets when it is addressed to a device in this state
    pub fn rejection(self) -> Option<HalError> {
        match self {
            Self::Ready | Self::Busy | Self::KeyGenBusy => None,
            Self::Locked => Some(HalError::Forbidden),
            Self::Tamper | Self::TamperReset => Some(HalError::Tamper),
            Self::NotReady | Self::Failed => Some(HalError::NotReady),
        }
    }
}

/// Shared, lock-free state cell for a device
#[derive(Debug)]
pub struct DeviceStatus {
    state: AtomicU8,
    busy: AtomicI64,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(DeviceState::Locked as u8),
            busy: AtomicI64::new(0),
        }
    }
}

impl DeviceStatus {
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `new_state` unless the device is in Tamper
    pub fn set_state(&self, new_state: DeviceState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != DeviceState::Tamper as u8).then_some(new_state as u8)
            });
    }

    /// Tamper overrides every other state
    pub fn force_tamper(&self) {
        self.state.store(DeviceState::Tamper as u8, Ordering::Release);
    }

    /// Leave Tamper for `new_state`; no effect in any other state
    pub fn clear_tamper(&self, new_state: DeviceState) {
        let _ = self.state.compare_exchange(
            DeviceState::Tamper as u8,
            new_state as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Locked or TamperReset become Ready
    pub fn unlock(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let locked = current == DeviceState::Locked as u8
                    || current == DeviceState::TamperReset as u8;
                locked.then_some(DeviceState::Ready as u8)
            });
    }

    /// Ready → KeyGenBusy. Returns whether the transition happened.
    pub fn begin_keygen(&self) -> bool {
        self.state
            .compare_exchange(
                DeviceState::Ready as u8,
                DeviceState::KeyGenBusy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// KeyGenBusy → Ready; a state set meanwhile (NotReady, Tamper) is kept
    pub fn end_keygen(&self) {
        let _ = self.state.compare_exchange(
            DeviceState::KeyGenBusy as u8,
            DeviceState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn busy_count(&self) -> i64 {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn add_busy(&self, amount: i64) {
        self.busy.fetch_add(amount, Ordering::Relaxed);
    }

    /// Load score, or -1 when the device cannot take work
    pub fn busy_factor(&self) -> i64 {
        match self.state() {
            DeviceState::Locked | DeviceState::NotReady | DeviceState::Tamper | DeviceState::Failed => -1,
            DeviceState::KeyGenBusy => self.busy_count() + 100,
            _ => self.busy_count(),
        }
    }
}
