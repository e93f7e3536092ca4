//! Touch gesture tracking and momentum scroll physics.
//!
//! State machine: `Idle -> Dragging -> (Decelerating -> Idle)`, with a
//! `Dragging -> PinchZooming -> Dragging` excursion for two-finger input.
//! Deceleration frames are driven by the host's animation scheduler through
//! [`FrameTicket`]s; a stale ticket (any newer gesture or explicit stop) is
//! ignored, so cancelled animations can never push phantom scroll deltas.

use std::collections::VecDeque;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GestureError {
    #[error("invalid gesture config: {0}")]
    InvalidConfig(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GesturePhase {
    Idle,
    Dragging,
    PinchZooming,
    Decelerating,
}

/// Tuning knobs for the physics. Defaults match a 60 Hz host.
#[derive(Clone, Copy, Debug)]
pub struct GestureConfig {
    /// Velocity multiplier applied once per animation frame.
    pub friction: f64,
    /// Deceleration stops when |velocity| drops below this (px/frame).
    pub min_velocity: f64,
    /// Trailing window of touch samples used for velocity estimation.
    pub sample_window_ms: u64,
    /// Two taps within this window (and slop radius) form a double-tap.
    pub double_tap_window_ms: u64,
    /// Max distance between two taps for a double-tap.
    pub double_tap_slop: f64,
    /// Max travel for a release to still count as a tap.
    pub tap_slop: f64,
    /// Nominal frame duration, converts px/ms velocity into px/frame.
    pub frame_interval_ms: f64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            friction: crate::DEFAULT_FRICTION,
            min_velocity: 0.5,
            sample_window_ms: crate::DEFAULT_SAMPLE_WINDOW_MS,
            double_tap_window_ms: crate::DEFAULT_DOUBLE_TAP_WINDOW_MS,
            double_tap_slop: 24.0,
            tap_slop: 8.0,
            frame_interval_ms: 1000.0 / 60.0,
        }
    }
}

impl GestureConfig {
    pub fn validate(&self) -> Result<(), GestureError> {
        if !(0.0..1.0).contains(&self.friction) {
            return Err(GestureError::InvalidConfig("friction must be in [0, 1)"));
        }
        if self.min_velocity <= 0.0 {
            return Err(GestureError::InvalidConfig("min_velocity must be > 0"));
        }
        if self.sample_window_ms == 0 {
            return Err(GestureError::InvalidConfig("sample_window_ms must be > 0"));
        }
        if self.frame_interval_ms <= 0.0 {
            return Err(GestureError::InvalidConfig("frame_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Liveness token for one deceleration run. Only tickets matching the
/// tracker's current generation may emit frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTicket {
    generation: u64,
}

/// What a touch release turned out to be.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReleaseOutcome {
    /// Finger came to rest; nothing to animate or report.
    Settled,
    /// Tap candidate; surfaced as a single tap by [`ScrollGesture::poll_tap`]
    /// once the double-tap window passes without a second tap.
    TapPending,
    /// Second tap on (nearly) the same spot within the window.
    DoubleTap,
    /// Flick; drive deceleration with the ticket.
    Momentum(FrameTicket),
}

#[derive(Clone, Copy, Debug)]
struct TouchSample {
    x: f64,
    y: f64,
    t_ms: u64,
}

/// Single-gesture tracker: consumes raw touch events, produces drag deltas,
/// momentum frames, and tap/double-tap signals.
#[derive(Debug)]
pub struct ScrollGesture {
    config: GestureConfig,
    phase: GesturePhase,
    samples: VecDeque<TouchSample>,
    origin: Option<TouchSample>,
    velocity: (f64, f64),
    generation: u64,
    pending_tap: Option<TouchSample>,
}

impl ScrollGesture {
    pub fn new(config: GestureConfig) -> Result<Self, GestureError> {
        config.validate()?;
        Ok(Self {
            config,
            phase: GesturePhase::Idle,
            samples: VecDeque::new(),
            origin: None,
            velocity: (0.0, 0.0),
            generation: 0,
            pending_tap: None,
        })
    }

    pub fn phase(&self) -> GesturePhase {
        self.phase
    }

    /// Current momentum velocity in px/frame.
    pub fn velocity(&self) -> (f64, f64) {
        self.velocity
    }

    /// Finger down. Cancels any deceleration in progress (residual velocity is
    /// discarded and outstanding tickets die).
    pub fn touch_start(&mut self, x: f64, y: f64, t_ms: u64) {
        self.generation += 1;
        self.phase = GesturePhase::Dragging;
        self.velocity = (0.0, 0.0);
        self.samples.clear();
        let sample = TouchSample { x, y, t_ms };
        self.samples.push_back(sample);
        self.origin = Some(sample);
    }

    /// Finger moved. Returns the drag delta since the previous sample.
    pub fn touch_move(&mut self, x: f64, y: f64, t_ms: u64) -> (f64, f64) {
        if self.phase != GesturePhase::Dragging {
            return (0.0, 0.0);
        }
        let delta = match self.samples.back() {
            Some(last) => (x - last.x, y - last.y),
            None => (0.0, 0.0),
        };
        self.samples.push_back(TouchSample { x, y, t_ms });
        self.prune_samples(t_ms);
        delta
    }

    /// Second finger down while dragging.
    pub fn pinch_start(&mut self) {
        if self.phase == GesturePhase::Dragging {
            self.phase = GesturePhase::PinchZooming;
            // Pre-pinch samples must not feed release velocity.
            self.samples.clear();
        }
    }

    /// Back to one finger.
    pub fn pinch_end(&mut self, x: f64, y: f64, t_ms: u64) {
        if self.phase == GesturePhase::PinchZooming {
            self.phase = GesturePhase::Dragging;
            self.samples.push_back(TouchSample { x, y, t_ms });
        }
    }

    /// Finger up. Classifies the gesture and, for a flick, seeds deceleration.
    pub fn touch_end(&mut self, x: f64, y: f64, t_ms: u64) -> ReleaseOutcome {
        if self.phase != GesturePhase::Dragging {
            self.phase = GesturePhase::Idle;
            return ReleaseOutcome::Settled;
        }
        self.samples.push_back(TouchSample { x, y, t_ms });
        self.prune_samples(t_ms);

        let travel = match self.origin {
            Some(origin) => ((x - origin.x).powi(2) + (y - origin.y).powi(2)).sqrt(),
            None => 0.0,
        };
        if travel <= self.config.tap_slop {
            self.phase = GesturePhase::Idle;
            return self.classify_tap(x, y, t_ms);
        }

        self.velocity = self.estimate_velocity();
        let (vx, vy) = self.velocity;
        if vx.hypot(vy) < self.config.min_velocity {
            self.velocity = (0.0, 0.0);
            self.phase = GesturePhase::Idle;
            return ReleaseOutcome::Settled;
        }
        self.phase = GesturePhase::Decelerating;
        ReleaseOutcome::Momentum(FrameTicket {
            generation: self.generation,
        })
    }

    /// One animation frame of deceleration. Returns the scroll delta to apply,
    /// or `None` when the ticket is stale or the animation has finished.
    pub fn frame(&mut self, ticket: FrameTicket) -> Option<(f64, f64)> {
        if ticket.generation != self.generation || self.phase != GesturePhase::Decelerating {
            return None;
        }
        self.velocity.0 *= self.config.friction;
        self.velocity.1 *= self.config.friction;
        let (vx, vy) = self.velocity;
        if vx.hypot(vy) < self.config.min_velocity {
            self.velocity = (0.0, 0.0);
            self.phase = GesturePhase::Idle;
            return None;
        }
        Some((vx, vy))
    }

    /// Explicit stop: kills any deceleration and invalidates tickets.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.velocity = (0.0, 0.0);
        self.phase = GesturePhase::Idle;
    }

    /// Surface a pending single tap once the double-tap window has expired.
    /// Returns the tap position, at most once per tap.
    pub fn poll_tap(&mut self, now_ms: u64) -> Option<(f64, f64)> {
        let tap = self.pending_tap?;
        if now_ms.saturating_sub(tap.t_ms) >= self.config.double_tap_window_ms {
            self.pending_tap = None;
            Some((tap.x, tap.y))
        } else {
            None
        }
    }

    fn classify_tap(&mut self, x: f64, y: f64, t_ms: u64) -> ReleaseOutcome {
        if let Some(prev) = self.pending_tap {
            let within_window = t_ms.saturating_sub(prev.t_ms) < self.config.double_tap_window_ms;
            let dist = ((x - prev.x).powi(2) + (y - prev.y).powi(2)).sqrt();
            if within_window && dist <= self.config.double_tap_slop {
                self.pending_tap = None;
                return ReleaseOutcome::DoubleTap;
            }
        }
        self.pending_tap = Some(TouchSample { x, y, t_ms });
        ReleaseOutcome::TapPending
    }

    /// Finite difference across the trailing sample window, in px/frame.
    fn estimate_velocity(&self) -> (f64, f64) {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) if l.t_ms > f.t_ms => (f, l),
            _ => return (0.0, 0.0),
        };
        let dt_ms = (last.t_ms - first.t_ms) as f64;
        (
            (last.x - first.x) / dt_ms * self.config.frame_interval_ms,
            (last.y - first.y) / dt_ms * self.config.frame_interval_ms,
        )
    }

    fn prune_samples(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.config.sample_window_ms);
        while let Some(front) = self.samples.front() {
            if front.t_ms < cutoff && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker() -> ScrollGesture {
        ScrollGesture::new(GestureConfig::default()).unwrap()
    }

    /// Straight vertical swipe: 10 px per 10 ms over 100 ms.
    fn swipe(g: &mut ScrollGesture) -> ReleaseOutcome {
        g.touch_start(0.0, 0.0, 0);
        for i in 1..=10u64 {
            g.touch_move(0.0, i as f64 * 10.0, i * 10);
        }
        g.touch_end(0.0, 110.0, 110)
    }

    #[test]
    fn config_validation() {
        assert!(GestureConfig { friction: 1.0, ..Default::default() }.validate().is_err());
        assert!(GestureConfig { friction: -0.1, ..Default::default() }.validate().is_err());
        assert!(GestureConfig { min_velocity: 0.0, ..Default::default() }.validate().is_err());
        assert!(GestureConfig::default().validate().is_ok());
    }

    #[test]
    fn drag_reports_deltas() {
        let mut g = tracker();
        g.touch_start(0.0, 0.0, 0);
        assert_eq!(g.phase(), GesturePhase::Dragging);
        assert_eq!(g.touch_move(3.0, 4.0, 16), (3.0, 4.0));
        assert_eq!(g.touch_move(3.0, 10.0, 32), (0.0, 6.0));
    }

    #[test]
    fn sample_window_slides() {
        let mut g = tracker();
        g.touch_start(0.0, 0.0, 0);
        for i in 1..=50u64 {
            g.touch_move(0.0, i as f64, i * 10);
        }
        // Only samples within the trailing 100ms survive.
        assert!(g.samples.len() <= 11);
        assert!(g.samples.front().unwrap().t_ms >= 400);
    }

    #[test]
    fn swipe_release_seeds_momentum() {
        let mut g = tracker();
        let outcome = swipe(&mut g);
        let ticket = match outcome {
            ReleaseOutcome::Momentum(t) => t,
            other => panic!("expected momentum, got {other:?}"),
        };
        assert_eq!(g.phase(), GesturePhase::Decelerating);

        // 1 px/ms upward swipe at 60Hz ~= 16.67 px/frame.
        let (vx, vy) = g.velocity();
        assert_eq!(vx, 0.0);
        assert!((vy - 1000.0 / 60.0).abs() < 1e-9);

        let (dx, dy) = g.frame(ticket).unwrap();
        assert_eq!(dx, 0.0);
        assert!(dy > 0.0);
    }

    #[test]
    fn velocity_decays_geometrically_then_idles() {
        let config = GestureConfig::default();
        let mut g = tracker();
        let ticket = match swipe(&mut g) {
            ReleaseOutcome::Momentum(t) => t,
            other => panic!("expected momentum, got {other:?}"),
        };
        let (_, v0) = g.velocity();

        let mut frames = 0u32;
        while g.frame(ticket).is_some() {
            frames += 1;
            let expected = v0 * config.friction.powi(frames as i32);
            let (_, vy) = g.velocity();
            assert!((vy - expected).abs() < 1e-9);
            assert!(frames < 1_000, "deceleration must terminate");
        }
        assert_eq!(g.phase(), GesturePhase::Idle);
        assert_eq!(g.velocity(), (0.0, 0.0));
        // Final velocity fell below the stop threshold.
        assert!(v0 * config.friction.powi(frames as i32 + 1) < config.min_velocity);
    }

    #[test]
    fn new_touch_cancels_deceleration_and_kills_ticket() {
        let mut g = tracker();
        let ticket = match swipe(&mut g) {
            ReleaseOutcome::Momentum(t) => t,
            other => panic!("expected momentum, got {other:?}"),
        };
        assert!(g.frame(ticket).is_some());

        g.touch_start(5.0, 5.0, 200);
        assert_eq!(g.phase(), GesturePhase::Dragging);
        assert_eq!(g.velocity(), (0.0, 0.0));
        // Stale ticket from the old run does nothing, forever.
        assert_eq!(g.frame(ticket), None);
        assert_eq!(g.frame(ticket), None);
    }

    #[test]
    fn stop_kills_outstanding_tickets() {
        let mut g = tracker();
        let ticket = match swipe(&mut g) {
            ReleaseOutcome::Momentum(t) => t,
            other => panic!("expected momentum, got {other:?}"),
        };
        g.stop();
        assert_eq!(g.phase(), GesturePhase::Idle);
        assert_eq!(g.frame(ticket), None);
    }

    #[test]
    fn slow_release_settles_without_momentum() {
        let mut g = tracker();
        g.touch_start(0.0, 0.0, 0);
        // 20px over 2 seconds: past tap slop, but far too slow to flick.
        for i in 1..=20u64 {
            g.touch_move(0.0, i as f64, i * 100);
        }
        assert_eq!(g.touch_end(0.0, 20.0, 2_100), ReleaseOutcome::Settled);
        assert_eq!(g.phase(), GesturePhase::Idle);
    }

    #[test]
    fn tap_is_deferred_until_double_tap_window_expires() {
        let mut g = tracker();
        g.touch_start(10.0, 10.0, 0);
        assert_eq!(g.touch_end(10.0, 10.0, 50), ReleaseOutcome::TapPending);

        // Not surfaced inside the window - a second tap may still arrive.
        assert_eq!(g.poll_tap(200), None);
        assert_eq!(g.poll_tap(350), Some((10.0, 10.0)));
        // At most once.
        assert_eq!(g.poll_tap(400), None);
    }

    #[test]
    fn two_taps_in_window_fire_double_tap_not_two_singles() {
        let mut g = tracker();
        g.touch_start(10.0, 10.0, 0);
        assert_eq!(g.touch_end(10.0, 10.0, 30), ReleaseOutcome::TapPending);
        g.touch_start(12.0, 9.0, 150);
        assert_eq!(g.touch_end(12.0, 9.0, 180), ReleaseOutcome::DoubleTap);
        // The first tap was consumed by the double-tap.
        assert_eq!(g.poll_tap(1_000), None);
    }

    #[test]
    fn distant_second_tap_does_not_double() {
        let mut g = tracker();
        g.touch_start(10.0, 10.0, 0);
        assert_eq!(g.touch_end(10.0, 10.0, 30), ReleaseOutcome::TapPending);
        g.touch_start(300.0, 10.0, 100);
        assert_eq!(g.touch_end(300.0, 10.0, 130), ReleaseOutcome::TapPending);
    }

    #[test]
    fn late_second_tap_does_not_double() {
        let mut g = tracker();
        g.touch_start(10.0, 10.0, 0);
        assert_eq!(g.touch_end(10.0, 10.0, 30), ReleaseOutcome::TapPending);
        g.touch_start(10.0, 10.0, 500);
        assert_eq!(g.touch_end(10.0, 10.0, 530), ReleaseOutcome::TapPending);
    }

    #[test]
    fn pinch_excursion_discards_pre_pinch_velocity() {
        let mut g = tracker();
        g.touch_start(0.0, 0.0, 0);
        for i in 1..=5u64 {
            g.touch_move(0.0, i as f64 * 30.0, i * 10);
        }
        g.pinch_start();
        assert_eq!(g.phase(), GesturePhase::PinchZooming);
        // Moves while pinching are not drag deltas.
        assert_eq!(g.touch_move(0.0, 400.0, 80), (0.0, 0.0));
        g.pinch_end(0.0, 150.0, 100);
        assert_eq!(g.phase(), GesturePhase::Dragging);

        // Release right after the pinch: no fast pre-pinch samples remain.
        assert_eq!(g.touch_end(0.0, 150.0, 110), ReleaseOutcome::Settled);
    }

    proptest! {
        #[test]
        fn decay_follows_v0_times_friction_pow_n(
            v0 in 10.0f64..2_000.0,
            friction in 0.5f64..0.99,
        ) {
            let config = GestureConfig { friction, ..Default::default() };
            let mut g = ScrollGesture::new(config).unwrap();
            // Synthesize a release with a known velocity.
            g.touch_start(0.0, 0.0, 0);
            let dist = v0 / config.frame_interval_ms * 100.0;
            for i in 1..=10u64 {
                g.touch_move(0.0, dist * i as f64 / 10.0, i * 10);
            }
            let outcome = g.touch_end(0.0, dist, 100);
            prop_assert!(matches!(outcome, ReleaseOutcome::Momentum(_)));
            let (_, seeded) = g.velocity();

            let ticket = match outcome {
                ReleaseOutcome::Momentum(t) => t,
                _ => unreachable!(),
            };
            for n in 1..=20i32 {
                if g.frame(ticket).is_none() {
                    break;
                }
                let (_, vy) = g.velocity();
                let expected = seeded * friction.powi(n);
                prop_assert!((vy - expected).abs() <= expected.abs() * 1e-9 + 1e-9);
            }
        }
    }
}
