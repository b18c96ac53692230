use std::sync::Arc;

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use model::{
    Discriminator, Generator, LatentInput, ProgressiveDiscriminator, StyledGenerator,
};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    averager::ParameterAverager,
    checkpoint::{self, CheckpointDescriptor, CheckpointTrigger, SaveRequest},
    config::to_runtime_error,
    data::{open_dataset, DataProvider, ImageDataset},
    logging::{IterationReport, Logger, LoggingSettings},
    loss::{scalar, AdversarialObjective, LossFamily},
    latent::LatentSampler,
    metrics::{IterationLosses, StepSnapshot, TrainingMetrics},
    optimizer::{accumulate_gradients, OptimizerConfig, ParameterGroup, TrainerOptimizer},
    sample::SampleWriter,
    scheduler::{
        BatchSizeTable, LearningRateTable, ResolutionScheduler, TierTransition, TrainingState,
    },
    TrainingConfig, TrainingError,
};

/// Which network the current half of an iteration updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Generator output is detached; only the discriminator steps.
    Discriminator,
    /// Discriminator gradients are discarded; only the generator steps.
    Generator,
}

impl TrainingPhase {
    fn generator_output(self, images: Tensor) -> Tensor {
        match self {
            TrainingPhase::Discriminator => images.detach(),
            TrainingPhase::Generator => images,
        }
    }
}

/// What one call to [`Trainer::run_iteration`] did.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub iteration: usize,
    pub transition: Option<TierTransition>,
    pub batch_size: usize,
    pub losses: IterationLosses,
    pub checkpoints: Vec<CheckpointDescriptor>,
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub state: TrainingState,
    pub checkpoints: Vec<CheckpointDescriptor>,
    pub data_restarts: usize,
    pub last_snapshot: Option<StepSnapshot>,
}

pub struct Trainer<G: Generator, D: Discriminator> {
    config: TrainingConfig,
    device: Device,
    generator: G,
    averager: ParameterAverager<G>,
    discriminator: D,
    g_optimizer: TrainerOptimizer,
    d_optimizer: TrainerOptimizer,
    d_parameters: Vec<Tensor>,
    objective: AdversarialObjective,
    scheduler: ResolutionScheduler,
    learning_rates: LearningRateTable,
    batch_sizes: BatchSizeTable,
    provider: DataProvider,
    latents: LatentSampler,
    penalty_rng: StdRng,
    state: TrainingState,
    metrics: TrainingMetrics,
    logger: Logger,
    samples: Option<SampleWriter>,
    checkpoints: Vec<CheckpointDescriptor>,
    last_snapshot: Option<StepSnapshot>,
}

impl Trainer<StyledGenerator, ProgressiveDiscriminator> {
    /// Builds the reference networks and opens the configured dataset.
    pub fn from_config(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.devices);
        if !device.is_cpu() {
            if let Err(err) = device.set_seed(config.runtime.seed) {
                eprintln!("warning: failed to seed device RNG: {}", err);
            }
        }

        let dataset: Arc<dyn ImageDataset> =
            Arc::from(open_dataset(&config.data.path, config.data.kind)?);
        println!(
            "dataset ready: {} image(s) from {}",
            dataset.len(),
            config.data.path.display()
        );

        let model_config = config.model_config(&device);
        let generator = StyledGenerator::new(model_config.clone()).map_err(to_runtime_error)?;
        let shadow = StyledGenerator::new(model_config.clone()).map_err(to_runtime_error)?;
        let discriminator = ProgressiveDiscriminator::new(model_config).map_err(to_runtime_error)?;

        Self::new(config, device, generator, shadow, discriminator, dataset)
    }
}

impl<G: Generator, D: Discriminator> Trainer<G, D> {
    /// `shadow` must be a second instance of the generator architecture; it is
    /// overwritten with a copy of `generator` before training starts.
    pub fn new(
        config: TrainingConfig,
        device: Device,
        generator: G,
        shadow: G,
        discriminator: D,
        dataset: Arc<dyn ImageDataset>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        crate::enable_higher_order_gradients();

        let scheduler = ResolutionScheduler::from_training_config(&config)?;
        let learning_rates = LearningRateTable::from_training_config(&config);
        let batch_sizes = BatchSizeTable::from_training_config(&config);
        let state = TrainingState::new(config.initial_step());
        let resolution = state.resolution();

        let provider = DataProvider::new(
            dataset,
            resolution,
            batch_sizes.initial(resolution),
            config.data.num_workers,
            device.clone(),
            config.runtime.seed,
        )?;

        let groups = generator.parameter_groups().map_err(to_runtime_error)?;
        let optimizer_config = OptimizerConfig::try_from(&config.optimizer)?;
        let mut g_optimizer = TrainerOptimizer::new(
            vec![
                ParameterGroup::new("synthesis", 1.0, groups.synthesis),
                ParameterGroup::new("style", config.optimizer.style_lr_mult, groups.style),
            ],
            optimizer_config.clone(),
        )?;
        let d_named = discriminator.parameters().map_err(to_runtime_error)?;
        let d_parameters = d_named
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let mut d_optimizer = TrainerOptimizer::new(
            vec![ParameterGroup::new("discriminator", 1.0, d_named)],
            optimizer_config,
        )?;

        let lr = learning_rates.rate_for(resolution);
        g_optimizer.set_learning_rate(lr);
        d_optimizer.set_learning_rate(lr);

        let averager = ParameterAverager::new(shadow, &generator)?;
        let mixing_prob = config.loss.mixing.then_some(config.loss.mixing_prob);
        let latents = LatentSampler::new(
            generator.code_size(),
            mixing_prob,
            device.clone(),
            config.runtime.seed,
        )?;
        let penalty_rng = StdRng::seed_from_u64(config.runtime.seed.wrapping_add(1));

        let logger = Logger::new(
            LoggingSettings::from_config(&config.runtime.logging),
            config.runtime.iterations,
        )?;
        let samples = match config.runtime.samples.as_ref() {
            Some(sample_config) => Some(SampleWriter::from_config(
                sample_config,
                generator.code_size(),
                device.clone(),
                config.runtime.seed.wrapping_add(2),
            )?),
            None => None,
        };

        if config.runtime.devices > 1 {
            logger.info(format!(
                "{} devices requested; training runs on the primary device",
                config.runtime.devices
            ));
        }
        logger.info(format!(
            "training {} iteration(s) with {} loss from {}px (max {}px), batch {}, lr {:.5}",
            config.runtime.iterations,
            config.loss.kind,
            resolution,
            config.progressive.max_size,
            provider.batch_size(),
            lr
        ));

        Ok(Self {
            objective: AdversarialObjective::from(config.loss.kind),
            config,
            device,
            generator,
            averager,
            discriminator,
            g_optimizer,
            d_optimizer,
            d_parameters,
            scheduler,
            learning_rates,
            batch_sizes,
            provider,
            latents,
            penalty_rng,
            state,
            metrics: TrainingMetrics::new(),
            logger,
            samples,
            checkpoints: Vec::new(),
            last_snapshot: None,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// The averaged generator used for sampling.
    pub fn shadow(&self) -> &G {
        self.averager.shadow()
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    pub fn data_provider(&self) -> &DataProvider {
        &self.provider
    }

    pub fn learning_rate(&self) -> f64 {
        self.g_optimizer.learning_rate()
    }

    /// Effective rate of each generator parameter group.
    pub fn generator_learning_rates(&self) -> Vec<(String, f64)> {
        self.g_optimizer.group_learning_rates()
    }

    pub fn discriminator_learning_rate(&self) -> f64 {
        self.d_optimizer.learning_rate()
    }

    pub fn checkpoints(&self) -> &[CheckpointDescriptor] {
        &self.checkpoints
    }

    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the configured number of iterations, checking `should_stop`
    /// between iterations.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let start = self.state.iteration;
        while self.state.iteration < self.config.runtime.iterations {
            if should_stop() {
                self.logger
                    .info(format!("stop requested at iteration {}", self.state.iteration));
                break;
            }
            self.run_iteration()?;
        }
        self.logger.finish();

        Ok(TrainingSummary {
            iterations: self.state.iteration - start,
            state: self.state.clone(),
            checkpoints: self.checkpoints.clone(),
            data_restarts: self.provider.restarts(),
            last_snapshot: self.last_snapshot.clone(),
        })
    }

    /// One full iteration: schedule, fetch, discriminator update, optional
    /// generator update, checkpoint and report.
    pub fn run_iteration(&mut self) -> Result<IterationOutcome, TrainingError> {
        let iteration = self.state.iteration;
        let checkpoints_before = self.checkpoints.len();

        let transition = self.scheduler.advance(&mut self.state);
        if let Some(transition) = transition {
            self.enter_tier(transition)?;
        }

        let batch = self.provider.next_batch()?;
        let batch_size = batch.len();
        self.state.record_samples(batch_size);

        let (discriminator, penalty) = self.discriminator_phase(&batch.images)?;
        let generator = if (iteration + 1) % self.config.loss.n_critic == 0 {
            Some(self.generator_phase(batch_size)?)
        } else {
            None
        };
        let losses = IterationLosses {
            discriminator,
            penalty,
            generator,
        };

        if (iteration + 1) % self.config.runtime.checkpoint.every_n_iters == 0 {
            self.save_checkpoint(CheckpointTrigger::Periodic {
                iteration: iteration + 1,
            })?;
        }

        if let Some(writer) = self.samples.as_mut() {
            if writer.is_due(iteration) {
                let path = writer.write(
                    self.averager.shadow(),
                    iteration,
                    self.state.step,
                    self.state.blend_factor,
                )?;
                self.logger
                    .info(format!("sample grid written to {}", path.display()));
            }
        }

        let snapshot = self.metrics.record_iteration(batch_size as u64, losses);
        self.logger.log_iteration(&IterationReport {
            iteration,
            resolution: self.state.resolution(),
            alpha: self.state.blend_factor,
            learning_rate: self.g_optimizer.learning_rate(),
            snapshot: &snapshot,
        });
        self.last_snapshot = Some(snapshot);
        self.state.iteration += 1;

        Ok(IterationOutcome {
            iteration,
            transition,
            batch_size,
            losses,
            checkpoints: self.checkpoints[checkpoints_before..].to_vec(),
        })
    }

    /// Side effects of entering a new tier: save the completed tier, restart
    /// the data stream at the new resolution, readjust both learning rates.
    fn enter_tier(&mut self, transition: TierTransition) -> Result<(), TrainingError> {
        self.save_checkpoint(CheckpointTrigger::TierCompleted {
            completed_step: transition.completed_step,
        })?;

        let batch_size = self.batch_sizes.for_step(transition.step);
        self.provider.rebuild(transition.resolution, batch_size)?;

        let lr = self.learning_rates.rate_for(transition.resolution);
        self.g_optimizer.set_learning_rate(lr);
        self.d_optimizer.set_learning_rate(lr);

        self.logger.info(format!(
            "entering step {} ({}px): batch {}, lr {:.5}",
            transition.step, transition.resolution, batch_size, lr
        ));
        Ok(())
    }

    fn discriminator_phase(&mut self, real: &Tensor) -> Result<(f64, f64), TrainingError> {
        let phase = TrainingPhase::Discriminator;
        let (step, alpha) = (self.state.step, self.state.blend_factor);
        let batch = real.dim(0).map_err(to_runtime_error)?;

        let latent = self.latents.sample(batch, step)?;
        let fake = self.render(&latent, phase)?;

        let terms = self.objective.discriminator_terms(
            &self.discriminator,
            real,
            &fake,
            step,
            alpha,
            &mut self.penalty_rng,
        )?;
        let mut grads = accumulate_gradients(&terms.as_losses(), &self.d_parameters)?;
        self.d_optimizer.step(&mut grads)?;

        Ok((terms.loss_value()?, terms.penalty_value()?))
    }

    fn generator_phase(&mut self, batch: usize) -> Result<f64, TrainingError> {
        let phase = TrainingPhase::Generator;
        let (step, alpha) = (self.state.step, self.state.blend_factor);

        let latent = self.latents.sample(batch, step)?;
        let fake = self.render(&latent, phase)?;
        let scores = self
            .discriminator
            .forward(&fake, step, alpha)
            .map_err(to_runtime_error)?;
        let loss = self.objective.generator_loss(&scores)?;

        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.d_optimizer.zero_grad(&mut grads);
        self.g_optimizer.step(&mut grads)?;
        self.averager
            .accumulate(&self.generator, self.config.loss.ema_decay)?;

        scalar(&loss)
    }

    fn render(&self, latent: &LatentInput, phase: TrainingPhase) -> Result<Tensor, TrainingError> {
        let images = self
            .generator
            .forward(latent, self.state.step, self.state.blend_factor)
            .map_err(to_runtime_error)?;
        Ok(phase.generator_output(images))
    }

    fn save_checkpoint(&mut self, trigger: CheckpointTrigger) -> Result<(), TrainingError> {
        if self.config.runtime.debug {
            return Ok(());
        }
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            directory: &self.config.runtime.checkpoint.directory,
            trigger,
            generator: &self.generator,
            discriminator: &self.discriminator,
            g_optimizer: &self.g_optimizer,
            d_optimizer: &self.d_optimizer,
            device: &self.device,
        })?;
        self.logger.info(format!(
            "checkpoint saved: {} ({} bytes, sha256 {})",
            descriptor.file.path.display(),
            descriptor.file.bytes,
            descriptor.file.sha256
        ));
        self.checkpoints.push(descriptor);
        Ok(())
    }
}

/// Picks Metal, then CUDA, then CPU. Only the primary device is used.
pub fn select_device(requested: usize) -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    println!(
        "device detection: cuda_available={} metal_available={} requested={}",
        cuda_available, metal_available, requested
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                println!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => {
                eprintln!(
                    "failed to initialize metal device, falling back to CPU: {}",
                    err
                );
            }
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                println!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
            }
        }
    } else {
        eprintln!("no GPU backend available; using CPU");
    }
    Device::Cpu
}
