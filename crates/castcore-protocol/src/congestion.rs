//! Congestion / bitrate controller.
//!
//! Watches NACK volume over a 3-second sliding window and, once per window,
//! re-derives the target bitrate from the observed NACKs/s using a
//! monotonic multiplicative table. A clean window
//! nudges the target back up towards the highest value that was recently
//! sustained under light loss (`working`); a lossy window backs off
//! immediately and hard. The recommendation is bucketed to the nearest
//! 500 kbps so the encoder isn't asked to reconfigure on every tick; burst
//! bitrate is a separate scalar with its own floor/ceiling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const WINDOW: Duration = Duration::from_secs(3);
const BUCKET_KBPS: u32 = 500;
const MIN_TARGET_KBPS: u32 = 500;
const MAX_TARGET_KBPS: u32 = 20_000;

const MIN_BURST_KBPS: u32 = 4_000;
const MAX_BURST_KBPS: u32 = 200_000;
const DEFAULT_BURST_KBPS: u32 = 100_000;

/// Recommended target/burst bitrate, emitted at most once per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateMessage {
    pub target_kbps: u32,
    pub burst_kbps: u32,
    /// FEC ratio recommended alongside the bitrate — tightened under loss so
    /// the fragmenter spends more of the reduced budget
    /// on repair fragments rather than originals.
    pub fec_ratio: f64,
}

fn bucket(kbps: u32) -> u32 {
    let clamped = kbps.clamp(MIN_TARGET_KBPS, MAX_TARGET_KBPS);
    (clamped / BUCKET_KBPS).max(1) * BUCKET_KBPS
}

/// Tracks NACK events in a 3-second sliding window and derives a bitrate
/// recommendation from their rate, per the multiplicative table above.
pub struct BitrateController {
    target_kbps: u32,
    burst_kbps: u32,
    /// Highest target recently sustained while NACKs/s stayed at or below
    /// the lightest-loss bucket (`<= 6`); used as the recovery ceiling.
    working_kbps: u32,
    nack_events: VecDeque<(Instant, usize)>,
    window_start: Instant,
}

impl BitrateController {
    pub fn new(initial_kbps: u32, now: Instant) -> Self {
        let target_kbps = bucket(initial_kbps);
        Self {
            target_kbps,
            burst_kbps: DEFAULT_BURST_KBPS,
            working_kbps: target_kbps,
            nack_events: VecDeque::new(),
            window_start: now,
        }
    }

    /// Record that `count` fragments were NACKed at `now`.
    pub fn record_nacks(&mut self, now: Instant, count: usize) {
        if count == 0 {
            return;
        }
        self.nack_events.push_back((now, count));
        self.evict_stale(now);
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.nack_events.front() {
            if now.duration_since(ts) > WINDOW {
                self.nack_events.pop_front();
            } else {
                break;
            }
        }
    }

    fn windowed_nack_count(&self, now: Instant) -> usize {
        self.nack_events
            .iter()
            .filter(|(ts, _)| now.duration_since(*ts) <= WINDOW)
            .map(|(_, c)| c)
            .sum()
    }

    /// Re-evaluate the target bitrate if a full window has elapsed since
    /// the last evaluation. Returns `Some` only on window boundaries, so
    /// the caller (the reliable control loop) emits at most one
    /// `BitrateMessage` per window.
    pub fn tick(&mut self, now: Instant) -> Option<BitrateMessage> {
        if now.duration_since(self.window_start) < WINDOW {
            return None;
        }
        self.window_start = now;
        self.evict_stale(now);

        let nacked = self.windowed_nack_count(now);
        let nacks_per_sec = nacked as f64 / WINDOW.as_secs_f64();

        self.target_kbps = if nacks_per_sec > 50.0 {
            bucket((self.target_kbps as f64 * 0.75) as u32)
        } else if nacks_per_sec > 25.0 {
            bucket((self.target_kbps as f64 * 0.83) as u32)
        } else if nacks_per_sec > 15.0 {
            bucket((self.target_kbps as f64 * 0.90) as u32)
        } else if nacks_per_sec > 10.0 {
            bucket((self.target_kbps as f64 * 0.95) as u32)
        } else if nacks_per_sec > 6.0 {
            bucket((self.target_kbps as f64 * 0.98) as u32)
        } else {
            self.working_kbps = self.working_kbps.max(self.target_kbps);
            let raised = (self.target_kbps as f64 * 1.05) as u32;
            let candidate = raised.max(self.working_kbps);
            bucket(((self.target_kbps + candidate) / 2).min(MAX_TARGET_KBPS))
        };

        Some(self.current())
    }

    /// Apply a client-reported available-bandwidth hint directly
    /// (`ClientMessage::Bitrate`), bucketed and clamped the same way.
    pub fn apply_client_hint(&mut self, target_kbps: u32, burst_kbps: u32) {
        self.target_kbps = bucket(target_kbps);
        self.burst_kbps = burst_kbps.clamp(MIN_BURST_KBPS, MAX_BURST_KBPS);
    }

    pub fn current(&self) -> BitrateMessage {
        BitrateMessage {
            target_kbps: self.target_kbps,
            burst_kbps: self.burst_kbps,
            fec_ratio: fec_ratio_for(self.target_kbps),
        }
    }
}

/// Heavier loss correlates with a lower achievable target; recommend more
/// FEC headroom as the target drops, within the valid `[0, 0.7]` range.
fn fec_ratio_for(target_kbps: u32) -> f64 {
    if target_kbps < 1_500 {
        0.4
    } else if target_kbps < 4_000 {
        0.2
    } else {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendation_is_always_bucketed() {
        let ctrl = BitrateController::new(4321, Instant::now());
        let msg = ctrl.current();
        assert_eq!(msg.target_kbps % BUCKET_KBPS, 0);
    }

    #[test]
    fn at_most_one_message_per_window() {
        let mut ctrl = BitrateController::new(8000, Instant::now());
        let t0 = Instant::now();
        assert!(ctrl.tick(t0).is_none());
        assert!(ctrl.tick(t0 + Duration::from_millis(500)).is_none());
        assert!(ctrl.tick(t0 + WINDOW + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn heavy_loss_backs_off_hard() {
        let mut ctrl = BitrateController::new(8000, Instant::now());
        let t0 = Instant::now();
        // > 50 NACKs/s over a 3s window means > 150 events.
        ctrl.record_nacks(t0, 200);
        let msg = ctrl.tick(t0 + WINDOW).unwrap();
        assert_eq!(msg.target_kbps, bucket((8000.0 * 0.75) as u32));
    }

    #[test]
    fn moderate_loss_backs_off_gently() {
        let mut ctrl = BitrateController::new(8000, Instant::now());
        let t0 = Instant::now();
        // ~8 NACKs/s -> the `> 6` bucket (0.98x).
        ctrl.record_nacks(t0, 24);
        let msg = ctrl.tick(t0 + WINDOW).unwrap();
        assert_eq!(msg.target_kbps, bucket((8000.0 * 0.98) as u32));
    }

    #[test]
    fn clean_window_recovers_towards_working() {
        let mut ctrl = BitrateController::new(1000, Instant::now());
        let t0 = Instant::now();
        let msg = ctrl.tick(t0 + WINDOW).unwrap();
        assert!(msg.target_kbps >= 1000);
    }

    #[test]
    fn burst_bitrate_has_its_own_bounds() {
        let ctrl = BitrateController::new(4000, Instant::now());
        let msg = ctrl.current();
        assert!(msg.burst_kbps >= MIN_BURST_KBPS);
        assert!(msg.burst_kbps <= MAX_BURST_KBPS);
    }

    #[test]
    fn old_nacks_fall_out_of_window() {
        let mut ctrl = BitrateController::new(8000, Instant::now());
        let t0 = Instant::now();
        ctrl.record_nacks(t0, 200);
        // Let the heavy-loss window age out before the next tick evaluates.
        let later = t0 + WINDOW + Duration::from_secs(4);
        let msg = ctrl.tick(later).unwrap();
        assert!(msg.target_kbps >= 8000);
    }

    #[test]
    fn target_never_drops_below_minimum() {
        let mut ctrl = BitrateController::new(MIN_TARGET_KBPS, Instant::now());
        let mut t = Instant::now();
        for _ in 0..10 {
            ctrl.record_nacks(t, 300);
            t += WINDOW + Duration::from_millis(1);
            ctrl.tick(t);
        }
        assert!(ctrl.current().target_kbps >= MIN_TARGET_KBPS);
    }

    #[test]
    fn client_hint_is_clamped_and_bucketed() {
        let mut ctrl = BitrateController::new(4000, Instant::now());
        ctrl.apply_client_hint(3333, 999_999);
        let msg = ctrl.current();
        assert_eq!(msg.target_kbps % BUCKET_KBPS, 0);
        assert_eq!(msg.burst_kbps, MAX_BURST_KBPS);
    }
}
