use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use portable_atomic::AtomicU8;
use util::sync::Mutex;
use util::Marshal;

use super::extension::{PlayoutDelayExtension, PLAYOUT_DELAY_MAX_VALUE};
use crate::error::Result;

/// Largest delay in milliseconds the extension can signal (12-bit field in
/// 10 ms steps).
pub const PLAYOUT_DELAY_DEFAULT_MAX: u32 = PLAYOUT_DELAY_MAX_VALUE as u32 * 10;

const JITTER_TO_DELAY_MULTIPLIER: u32 = 25;

const UINT16SIZE_HALF: u16 = 1 << 15;

/// PlayoutDelayState tracks whether the currently encoded delay still has to
/// be put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayoutDelayState {
    /// A new delay value exists that has not been attached to any packet yet.
    Changed = 0,
    /// The value is being attached to every outgoing packet, awaiting
    /// acknowledgment.
    Sending = 1,
    /// The remote end has seen the value, nothing is attached until it
    /// changes again.
    Acked = 2,
}

impl From<u8> for PlayoutDelayState {
    fn from(v: u8) -> Self {
        match v {
            1 => PlayoutDelayState::Sending,
            2 => PlayoutDelayState::Acked,
            _ => PlayoutDelayState::Changed,
        }
    }
}

struct ControllerInner {
    current_delay: u32,
    sending_at_seq: u16,
}

/// PlayoutDelayController converts a jitter measurement into a bounded target
/// playout delay and keeps announcing the encoded value on outgoing packets
/// until the remote end acknowledges it.
///
/// next_extension in the Sending and Acked states touches only the atomic
/// state cell and the swapped-in buffer, so the per-packet send path never
/// contends with a concurrent jitter update.
pub struct PlayoutDelayController {
    inner: Mutex<ControllerInner>,
    state: AtomicU8,
    ext_bytes: ArcSwap<Bytes>,
    min_delay: u32,
    max_delay: u32,
}

impl PlayoutDelayController {
    /// new creates a controller with delay bounds in milliseconds. A zero or
    /// out-of-range max_delay falls back to the largest signalable delay.
    /// Fails if the initial delay value cannot be encoded.
    pub fn new(min_delay: u32, max_delay: u32) -> Result<Self> {
        let max_delay = if max_delay == 0 || max_delay > PLAYOUT_DELAY_DEFAULT_MAX {
            PLAYOUT_DELAY_DEFAULT_MAX
        } else {
            max_delay
        };

        let controller = PlayoutDelayController {
            inner: Mutex::new(ControllerInner {
                current_delay: min_delay,
                sending_at_seq: 0,
            }),
            state: AtomicU8::new(PlayoutDelayState::Changed as u8),
            ext_bytes: ArcSwap::from_pointee(Bytes::new()),
            min_delay,
            max_delay,
        };

        let ext_bytes = controller.encode(min_delay)?;
        controller.ext_bytes.store(Arc::new(ext_bytes));

        Ok(controller)
    }

    /// set_jitter recomputes the target delay from a jitter measurement in
    /// milliseconds. The delay is raised quickly and lowered slowly so the
    /// remote playout buffer does not oscillate.
    pub fn set_jitter(&self, jitter: u32) {
        let mut inner = self.inner.lock();

        // widen before smoothing, jitter * 25 alone can reach past u32::MAX
        let current = u64::from(inner.current_delay);
        let mut target = u64::from(jitter) * u64::from(JITTER_TO_DELAY_MULTIPLIER);
        if target > current {
            target = current + (target - current) * 3 / 4;
        } else {
            target = current - (current - target) / 5;
        }
        let target = target.clamp(u64::from(self.min_delay), u64::from(self.max_delay)) as u32;

        if target == inner.current_delay {
            return;
        }

        // the new bytes must be visible no later than the new delay, so the
        // encode happens inside the critical section
        match self.encode(target) {
            Ok(ext_bytes) => {
                inner.current_delay = target;
                self.ext_bytes.store(Arc::new(ext_bytes));
                self.state
                    .store(PlayoutDelayState::Changed as u8, Ordering::Release);
            }
            Err(err) => {
                log::error!("failed to marshal playout delay {target}ms: {err}");
            }
        }
    }

    /// next_extension is called once per outgoing packet and returns the
    /// extension payload to attach, if any. seq is the packet's sequence
    /// number.
    pub fn next_extension(&self, seq: u16) -> Option<Bytes> {
        match self.state.load(Ordering::Acquire).into() {
            PlayoutDelayState::Changed => {
                {
                    let mut inner = self.inner.lock();
                    inner.sending_at_seq = seq;
                    self.state
                        .store(PlayoutDelayState::Sending as u8, Ordering::Release);
                }
                Some((*self.ext_bytes.load_full()).clone())
            }
            PlayoutDelayState::Sending => Some((*self.ext_bytes.load_full()).clone()),
            PlayoutDelayState::Acked => None,
        }
    }

    /// on_seq_acked marks the current value as received once the remote end
    /// acknowledges any sequence number at or after the first one it was
    /// attached to, using half-range circular comparison.
    pub fn on_seq_acked(&self, seq: u16) {
        let inner = self.inner.lock();
        if self.state.load(Ordering::Acquire) == PlayoutDelayState::Sending as u8
            && seq.wrapping_sub(inner.sending_at_seq) < UINT16SIZE_HALF
        {
            self.state
                .store(PlayoutDelayState::Acked as u8, Ordering::Release);
        }
    }

    pub fn current_delay(&self) -> u32 {
        self.inner.lock().current_delay
    }

    pub fn state(&self) -> PlayoutDelayState {
        self.state.load(Ordering::Acquire).into()
    }

    fn encode(&self, delay: u32) -> Result<Bytes> {
        let ext = PlayoutDelayExtension::new((delay / 10) as u16, (self.max_delay / 10) as u16);
        Ok(ext.marshal()?)
    }
}
