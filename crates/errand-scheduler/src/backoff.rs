//! Multiplicative backoff with a floor and a ceiling.
//!
//! The unit of the delay value is up to the caller: the scheduler counts in
//! minutes, the invoker in seconds. Every use site owns its own controller.

/// Default growth factor applied by [`BackoffController::increase`].
pub const DEFAULT_FACTOR: f64 = 1.5;

/// Stateful backoff generator.
///
/// `min <= current <= max` holds after construction and after every
/// mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffController {
    initial: f64,
    current: f64,
    min: f64,
    max: f64,
    factor: f64,
}

impl BackoffController {
    /// Create a controller starting at `initial`, capped at `max`.
    ///
    /// The floor defaults to `initial` and the factor to [`DEFAULT_FACTOR`].
    pub fn new(initial: f64, max: f64) -> Self {
        let mut controller = Self {
            initial,
            current: initial,
            min: initial,
            max,
            factor: DEFAULT_FACTOR,
        };
        controller.current = controller.clamp(initial);
        controller
    }

    /// Set the growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the floor, re-clamping the current value.
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = min;
        self.current = self.clamp(self.current);
        self
    }

    /// The current delay value.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Grow the delay after an idle or failed cycle and return it.
    pub fn increase(&mut self) -> f64 {
        self.current = self.clamp((self.current * self.factor).ceil());
        self.current
    }

    /// Return to the initial delay after productive work and return it.
    pub fn reset(&mut self) -> f64 {
        self.current = self.clamp(self.initial);
        self.current
    }

    /// Clamp `value` into `[min, max]`.
    pub fn clamp(&self, value: f64) -> f64 {
        self.max.min(self.min.max(value))
    }
}
