use std::collections::BTreeMap;

use model::resolution_for_step;
use serde::{Deserialize, Serialize};

use crate::config::{ResolutionEntry, TrainingConfig, TrainingError};

/// Progress through the resolution curriculum. Owned by the trainer and
/// threaded through the scheduler explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub step: usize,
    pub samples_seen_in_phase: usize,
    pub blend_factor: f64,
    pub iteration: usize,
}

impl TrainingState {
    pub fn new(step: usize) -> Self {
        Self {
            step,
            samples_seen_in_phase: 0,
            blend_factor: 0.0,
            iteration: 0,
        }
    }

    pub fn resolution(&self) -> usize {
        resolution_for_step(self.step)
    }

    pub fn record_samples(&mut self, count: usize) {
        self.samples_seen_in_phase = self.samples_seen_in_phase.saturating_add(count);
    }
}

/// Emitted when the scheduler enters a brand-new tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTransition {
    pub completed_step: usize,
    pub step: usize,
    pub resolution: usize,
}

#[derive(Debug, Clone)]
pub struct ResolutionScheduler {
    phase_length: usize,
    max_step: usize,
}

impl ResolutionScheduler {
    pub fn new(phase_length: usize, max_step: usize) -> Result<Self, TrainingError> {
        if phase_length == 0 {
            return Err(TrainingError::initialization(
                "resolution scheduler requires a phase length greater than zero",
            ));
        }
        Ok(Self {
            phase_length,
            max_step,
        })
    }

    pub fn from_training_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        Self::new(config.progressive.phase, config.max_step())
    }

    pub fn phase_length(&self) -> usize {
        self.phase_length
    }

    pub fn max_step(&self) -> usize {
        self.max_step
    }

    pub fn blend_factor(&self, samples_seen_in_phase: usize) -> f64 {
        (samples_seen_in_phase as f64 / self.phase_length as f64).min(1.0)
    }

    /// Updates the blend factor from the samples seen so far, then advances
    /// the tier once more than two phase lengths have been consumed. At the
    /// last tier the step stays clamped and nothing is reset.
    pub fn advance(&self, state: &mut TrainingState) -> Option<TierTransition> {
        state.blend_factor = self.blend_factor(state.samples_seen_in_phase);

        if state.samples_seen_in_phase <= self.phase_length.saturating_mul(2) {
            return None;
        }

        let next = state.step + 1;
        if next > self.max_step {
            state.step = self.max_step;
            return None;
        }

        let completed_step = state.step;
        state.step = next;
        state.samples_seen_in_phase = 0;
        state.blend_factor = 0.0;

        Some(TierTransition {
            completed_step,
            step: next,
            resolution: resolution_for_step(next),
        })
    }
}

/// Resolution-keyed lookup with a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionTable<T> {
    entries: BTreeMap<usize, T>,
}

impl<T: Copy> ResolutionTable<T> {
    pub fn new(entries: impl IntoIterator<Item = (usize, T)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, resolution: usize) -> Option<T> {
        self.entries.get(&resolution).copied()
    }

    pub fn get_or(&self, resolution: usize, default: T) -> T {
        self.get(resolution).unwrap_or(default)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn overlay(&mut self, entries: &[ResolutionEntry<T>]) {
        for entry in entries {
            self.entries.insert(entry.resolution, entry.value);
        }
    }
}

const SCHEDULED_LEARNING_RATES: [(usize, f64); 4] =
    [(128, 0.0015), (256, 0.002), (512, 0.003), (1024, 0.003)];

const SCHEDULED_BATCH_SIZES: [(usize, usize); 7] = [
    (4, 512),
    (8, 256),
    (16, 128),
    (32, 64),
    (64, 32),
    (128, 32),
    (256, 32),
];

#[derive(Debug, Clone)]
pub struct LearningRateTable {
    table: ResolutionTable<f64>,
    default_rate: f64,
}

impl LearningRateTable {
    pub fn new(table: ResolutionTable<f64>, default_rate: f64) -> Self {
        Self {
            table,
            default_rate,
        }
    }

    pub fn from_training_config(config: &TrainingConfig) -> Self {
        let mut table = if config.progressive.sched {
            ResolutionTable::new(SCHEDULED_LEARNING_RATES)
        } else {
            ResolutionTable::empty()
        };
        table.overlay(&config.optimizer.lr_schedule);
        Self::new(table, config.optimizer.learning_rate)
    }

    pub fn rate_for(&self, resolution: usize) -> f64 {
        self.table.get_or(resolution, self.default_rate)
    }
}

#[derive(Debug, Clone)]
pub struct BatchSizeTable {
    table: ResolutionTable<usize>,
    base_batch_size: usize,
}

impl BatchSizeTable {
    pub fn new(table: ResolutionTable<usize>, base_batch_size: usize) -> Self {
        Self {
            table,
            base_batch_size,
        }
    }

    pub fn from_training_config(config: &TrainingConfig) -> Self {
        let mut table = if config.progressive.sched {
            ResolutionTable::new(SCHEDULED_BATCH_SIZES)
        } else {
            ResolutionTable::empty()
        };
        table.overlay(&config.data.batch_schedule);
        Self::new(table, config.data.batch_size)
    }

    /// Batch size for the tier training starts at.
    pub fn initial(&self, resolution: usize) -> usize {
        self.table.get_or(resolution, self.base_batch_size)
    }

    /// Batch size for a tier entered during training: halves per tier past
    /// the first, never below one.
    pub fn for_step(&self, step: usize) -> usize {
        let resolution = resolution_for_step(step);
        let shift = step.saturating_sub(1).min(usize::BITS as usize - 1);
        let fallback = (self.base_batch_size >> shift).max(1);
        self.table.get_or(resolution, fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_halves_per_tier() {
        let table = BatchSizeTable::new(ResolutionTable::empty(), 32);
        assert_eq!(table.initial(8), 32);
        assert_eq!(table.for_step(1), 32);
        assert_eq!(table.for_step(2), 16);
        assert_eq!(table.for_step(3), 8);
        assert_eq!(table.for_step(8), 1);
        assert_eq!(table.for_step(40), 1);
    }

    #[test]
    fn table_entries_take_precedence() {
        let table = BatchSizeTable::new(ResolutionTable::new([(16, 128)]), 32);
        assert_eq!(table.for_step(2), 128);
        assert_eq!(table.for_step(3), 8);
    }
}
