//! EWMA smoothing and hysteresis gating of advertised health metrics.

use chrono::{DateTime, Utc};

use weft_types::{HysteresisConfig, WeftError};

/// Exponential weighted moving average over a scalar stream.
///
/// `s ← α·x + (1−α)·s`, seeded with the first observation.
#[derive(Debug, Clone)]
pub struct EwmaSmoother {
    alpha: f64,
    smoothed: Option<f64>,
}

impl EwmaSmoother {
    /// Build a smoother with the given factor in `(0, 1]`.
    #[must_use]
    pub const fn new(alpha: f64) -> Self {
        Self {
            alpha,
            smoothed: None,
        }
    }

    /// Fold a new observation into the average and return it.
    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.smoothed {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        };
        self.smoothed = Some(next);
        next
    }

    /// Current smoothed value, if any observation has been folded in.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        self.smoothed
    }

    /// Forget all state.
    pub const fn reset(&mut self) {
        self.smoothed = None;
    }
}

/// Gates a health metric stream behind hysteresis.
///
/// The first observation is always advertised. Subsequent observations pass
/// only when the (optionally smoothed) value moved by at least
/// `change_threshold_percent` relative to the last advertised value AND
/// `stabilization_period_seconds` have elapsed since the last advertisement.
/// Everything else increments the suppressed counter.
#[derive(Debug)]
pub struct HealthMetricsProcessor {
    config: HysteresisConfig,
    smoother: Option<EwmaSmoother>,
    last_advertised: Option<f64>,
    last_change: Option<DateTime<Utc>>,
    current_smoothed: Option<f64>,
    suppressed_updates: u64,
}

impl HealthMetricsProcessor {
    /// Build a processor, validating the configuration.
    ///
    /// # Errors
    /// Propagates `WeftError::Config` from `HysteresisConfig::validate`.
    pub fn new(config: HysteresisConfig) -> Result<Self, WeftError> {
        config.validate()?;
        let smoother = config.ewma_enabled.then(|| EwmaSmoother::new(config.ewma_alpha));
        Ok(Self {
            config,
            smoother,
            last_advertised: None,
            last_change: None,
            current_smoothed: None,
            suppressed_updates: 0,
        })
    }

    /// Decide whether a new sample should be advertised at `now`.
    pub fn should_advertise_at(&mut self, sample: f64, now: DateTime<Utc>) -> bool {
        let smoothed = match &mut self.smoother {
            Some(smoother) => smoother.update(sample),
            None => sample,
        };
        self.current_smoothed = Some(smoothed);

        let Some(last_advertised) = self.last_advertised else {
            // First observation always goes out.
            self.last_advertised = Some(smoothed);
            self.last_change = Some(now);
            return true;
        };

        let percent_change = if last_advertised == 0.0 {
            if smoothed == 0.0 { 0.0 } else { f64::INFINITY }
        } else {
            (smoothed - last_advertised).abs() / last_advertised * 100.0
        };

        if percent_change >= self.config.change_threshold_percent {
            let stabilized = self.last_change.is_none_or(|last| {
                (now - last).num_milliseconds() as f64 / 1000.0
                    >= f64::from(self.config.stabilization_period_seconds)
            });
            if stabilized {
                self.last_advertised = Some(smoothed);
                self.last_change = Some(now);
                return true;
            }
        }

        self.suppressed_updates += 1;
        false
    }

    /// [`Self::should_advertise_at`] against the current wall clock.
    pub fn should_advertise(&mut self, sample: f64) -> bool {
        self.should_advertise_at(sample, Utc::now())
    }

    /// The latest smoothed value.
    #[must_use]
    pub fn smoothed_value(&self) -> Option<f64> {
        match &self.smoother {
            Some(smoother) => smoother.value(),
            None => self.current_smoothed,
        }
    }

    /// The last value actually advertised.
    #[must_use]
    pub const fn last_advertised(&self) -> Option<f64> {
        self.last_advertised
    }

    /// How many samples have been gated since construction or reset.
    #[must_use]
    pub const fn suppressed_updates(&self) -> u64 {
        self.suppressed_updates
    }

    /// Forget all internal state.
    pub fn reset(&mut self) {
        self.last_advertised = None;
        self.last_change = None;
        self.current_smoothed = None;
        self.suppressed_updates = 0;
        if let Some(smoother) = &mut self.smoother {
            smoother.reset();
        }
    }
}
