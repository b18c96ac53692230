use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Losses produced by one training iteration. The generator loss is absent on
/// iterations that skip the generator phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationLosses {
    pub discriminator: f64,
    pub penalty: f64,
    pub generator: Option<f64>,
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    images_processed: u64,
    last_generator_loss: f64,
    d_loss_ema: ExponentialMovingAverage,
    g_loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            images_processed: 0,
            last_generator_loss: 0.0,
            d_loss_ema: ExponentialMovingAverage::new(0.1),
            g_loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_iteration(&mut self, images: u64, losses: IterationLosses) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.images_processed = self.images_processed.saturating_add(images);
        let step_images_per_sec = if step_duration > Duration::ZERO {
            images as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        if let Some(loss) = losses.generator {
            self.last_generator_loss = loss;
            self.g_loss_ema.update(loss);
        }

        StepSnapshot {
            discriminator_loss: losses.discriminator,
            discriminator_loss_ema: self.d_loss_ema.update(losses.discriminator),
            generator_loss: self.last_generator_loss,
            generator_loss_ema: self.g_loss_ema.value().unwrap_or(0.0),
            penalty: losses.penalty,
            images,
            step_images_per_sec,
            images_per_sec: self.throughput_ema.update(step_images_per_sec),
            total_images: self.images_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub discriminator_loss: f64,
    pub discriminator_loss_ema: f64,
    /// Most recent generator loss, carried over on critic-only iterations.
    pub generator_loss: f64,
    pub generator_loss_ema: f64,
    pub penalty: f64,
    pub images: u64,
    pub step_images_per_sec: f64,
    pub images_per_sec: f64,
    pub total_images: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}
