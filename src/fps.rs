use std::time::{Duration, Instant};

const SMOOTHING: f32 = 0.1;

/// Frame rate as an exponential moving average over frame intervals.
#[derive(Debug, Default)]
pub struct FpsCounter {
    last: Option<Instant>,
    fps: Option<f32>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        if let Some(last) = self.last.replace(now) {
            let elapsed = now.saturating_duration_since(last);
            if elapsed > Duration::ZERO {
                let instant = 1. / elapsed.as_secs_f32();
                self.fps = Some(match self.fps {
                    Some(fps) => fps + SMOOTHING * (instant - fps),
                    None => instant,
                });
            }
        }
    }

    /// Smoothed frames per second, zero until two frames have been seen.
    pub fn fps(&self) -> f32 {
        self.fps.unwrap_or(0.)
    }
}
