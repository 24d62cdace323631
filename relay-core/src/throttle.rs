//! Packet-level rate limits: the passthrough bitrate ceiling and the
//! per-path sampling used when both paths run at once.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    packet::{MediaType, RawPacket, UnitInfo},
    switch::PathKind,
};

pub const DEFAULT_AVERAGING_PERIOD: Duration = Duration::from_secs(1);

struct ThrottleState {
    ceiling: u64,
    window: Duration,
    /// (timestamp in seconds, bytes) of admitted video units inside the window
    samples: VecDeque<(f64, usize)>,
    bytes_in_window: usize,
    holding: bool,
    dropped: u64,
}

/// Drops passthrough video once its rolling average bitrate goes above the
/// ceiling, and resumes at the first key frame that arrives under it.
/// A ceiling of 0 disables the throttle.
pub struct BitrateThrottle {
    state: Mutex<ThrottleState>,
}

impl Default for BitrateThrottle {
    fn default() -> Self {
        Self::new(0, DEFAULT_AVERAGING_PERIOD)
    }
}

impl BitrateThrottle {
    pub fn new(ceiling: u64, window: Duration) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                ceiling,
                window: Self::sane_window(window),
                samples: VecDeque::new(),
                bytes_in_window: 0,
                holding: false,
                dropped: 0,
            }),
        }
    }

    fn sane_window(window: Duration) -> Duration {
        if window.is_zero() {
            DEFAULT_AVERAGING_PERIOD
        } else {
            window
        }
    }

    /// Replaces ceiling and window; history is dropped.
    pub fn arm(&self, ceiling: u64, window: Duration) {
        let mut state = self.state.lock();
        state.ceiling = ceiling;
        state.window = Self::sane_window(window);
        state.samples.clear();
        state.bytes_in_window = 0;
        state.holding = false;
        if ceiling > 0 {
            log::info!(
                "passthrough throttle armed: {} bps over {:?}",
                ceiling,
                state.window
            );
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.state.lock().ceiling
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Average bitrate of what was admitted over the window, in bits/s.
    fn average_of(state: &ThrottleState) -> u64 {
        (state.bytes_in_window as f64 * 8.0 / state.window.as_secs_f64()) as u64
    }

    pub fn admit(&self, packet: &RawPacket) -> bool {
        if packet.media_type() != MediaType::Video {
            return true;
        }
        let Some(ts) = packet.dts().or(packet.pts()) else {
            return true;
        };
        let tb = packet.time_base();
        if tb.denominator() == 0 {
            return true;
        }
        let seconds = ts as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        self.admit_at(seconds, packet.size(), packet.is_key())
    }

    fn admit_at(&self, seconds: f64, size: usize, is_key: bool) -> bool {
        let mut state = self.state.lock();
        if state.ceiling == 0 {
            return true;
        }

        let horizon = seconds - state.window.as_secs_f64();
        while let Some((t, bytes)) = state.samples.front().copied() {
            // a timestamp jump backwards restarts the window
            if t <= horizon || t > seconds {
                state.samples.pop_front();
                state.bytes_in_window -= bytes;
            } else {
                break;
            }
        }

        let over = Self::average_of(&state) > state.ceiling;
        if state.holding {
            if !is_key || over {
                state.dropped += 1;
                return false;
            }
            log::debug!("passthrough throttle released at key frame");
            state.holding = false;
        } else if over {
            log::debug!(
                "passthrough over {} bps, holding until next key frame",
                state.ceiling
            );
            state.holding = true;
            state.dropped += 1;
            return false;
        }

        state.samples.push_back((seconds, size));
        state.bytes_in_window += size;
        true
    }
}

/// Decides per path which units pass when both paths are active.
pub trait SamplingPolicy: Send + Sync {
    fn admit(&self, path: PathKind, unit: &UnitInfo) -> bool;
}

#[derive(Default)]
pub struct PassAll;

impl SamplingPolicy for PassAll {
    fn admit(&self, _path: PathKind, _unit: &UnitInfo) -> bool {
        true
    }
}

/// Keeps every video key frame and one in `n` of the other units, counted
/// separately per path.
pub struct EveryNth {
    n: u64,
    counters: [AtomicU64; 2],
}

impl EveryNth {
    pub fn new(n: u64) -> Self {
        Self {
            n: n.max(1),
            counters: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }
}

impl SamplingPolicy for EveryNth {
    fn admit(&self, path: PathKind, unit: &UnitInfo) -> bool {
        if unit.is_video_key_frame() {
            return true;
        }
        let seen = self.counters[path as usize].fetch_add(1, Ordering::Relaxed);
        seen % self.n == 0
    }
}
