/// Frame-count sampling policy deciding which frames pay for a detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionScheduler {
    every: u64,
}

impl DetectionScheduler {
    /// `every` is clamped to at least one (detect on every frame).
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn interval(&self) -> u64 {
        self.every
    }

    /// True on multiples of the sampling interval.
    pub fn should_detect(&self, frame_counter: u64) -> bool {
        frame_counter % self.every == 0
    }
}
