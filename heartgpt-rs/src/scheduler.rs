//! Learning rate schedulers.

use crate::config::LrScheduler;

/// Warmup length for `ratio` of `total_steps`, rounded up.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn warmup_steps(ratio: f64, total_steps: usize) -> usize {
    (ratio * total_steps as f64).ceil() as usize
}

/// Learning rate scheduler.
///
/// The rate returned by [`get_lr`](Self::get_lr) is the one used for the
/// optimizer step about to run; [`step`](Self::step) advances to the next.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    kind: LrScheduler,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(kind: LrScheduler, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Get learning rate for current step.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_lr(&self) -> f64 {
        let step = self.current_step;
        if self.kind == LrScheduler::Constant {
            return self.base_lr;
        }
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = (step - self.warmup_steps) as f64 / decay_steps;
        match self.kind {
            LrScheduler::Linear => self.base_lr * (1.0 - progress).max(0.0),
            LrScheduler::Cosine => {
                self.base_lr * (0.5 * (1.0 + (std::f64::consts::PI * progress).cos())).max(0.0)
            }
            LrScheduler::Constant => self.base_lr,
        }
    }

    /// Advance one optimizer step and return the new rate.
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    /// Steps taken so far.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_is_rounded_up() {
        assert_eq!(warmup_steps(0.03, 10), 1);
        assert_eq!(warmup_steps(0.03, 100), 3);
        assert_eq!(warmup_steps(0.03, 101), 4);
        assert_eq!(warmup_steps(0.0, 100), 0);
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LRScheduler::new(LrScheduler::Constant, 1e-3, 10, 100);
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-12);
        scheduler.step();
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_linear_warmup_and_decay() {
        let mut scheduler = LRScheduler::new(LrScheduler::Linear, 1e-3, 100, 1000);
        assert!(scheduler.get_lr().abs() < 1e-12);

        scheduler.current_step = 50;
        assert!((scheduler.get_lr() - 5e-4).abs() < 1e-10);

        scheduler.current_step = 100;
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-10);

        scheduler.current_step = 550;
        assert!((scheduler.get_lr() - 5e-4).abs() < 1e-10);

        scheduler.current_step = 2000;
        assert!(scheduler.get_lr().abs() < 1e-12);
    }

    #[test]
    fn test_cosine_scheduler() {
        let mut scheduler = LRScheduler::new(LrScheduler::Cosine, 2e-4, 3, 100);
        assert!(scheduler.get_lr().abs() < 1e-12);
        assert!((scheduler.step() - 2e-4 / 3.0).abs() < 1e-12);

        scheduler.current_step = 3;
        assert!((scheduler.get_lr() - 2e-4).abs() < 1e-12);

        scheduler.current_step = 3 + 97 / 2;
        let mid = scheduler.get_lr();
        assert!(mid > 0.9e-4 && mid < 1.1e-4);

        scheduler.current_step = 100;
        assert!(scheduler.get_lr() < 1e-12);
    }

    #[test]
    fn test_no_warmup_starts_at_base_rate() {
        let scheduler = LRScheduler::new(LrScheduler::Cosine, 1e-3, 0, 10);
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-12);
    }
}
