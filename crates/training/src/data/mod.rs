mod dataset;

use std::sync::Arc;

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use image::DynamicImage;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::config::{to_runtime_error, TrainingError};

pub use dataset::{
    open_dataset, ImageDataset, ImageFolder, ImageTransform, InMemoryDataset, LsunClass,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch of real images at one resolution, `[b, 3, r, r]` in `[-1, 1]`.
#[derive(Debug)]
pub struct ImageBatch {
    pub images: Tensor,
    /// Carried for dataset compatibility; no loss reads them.
    pub labels: Vec<u32>,
    pub resolution: usize,
    pub pass: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Asynchronous-compatible loader abstraction. `Ok(None)` signals that the
/// stream is exhausted.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ImageBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<ImageBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// One shuffled pass over a dataset rendered at a single resolution.
pub struct ResolutionDataLoader {
    dataset: Arc<dyn ImageDataset>,
    transform: ImageTransform,
    device: Device,
    batch_size: usize,
    /// Decode pool; `None` renders on the calling thread.
    pool: Option<ThreadPool>,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
    pass: usize,
}

impl ResolutionDataLoader {
    pub fn new(
        dataset: Arc<dyn ImageDataset>,
        resolution: usize,
        batch_size: usize,
        num_workers: usize,
        device: Device,
        seed: u64,
        pass: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization(
                "training dataset is empty; no images available",
            ));
        }

        let pool = if num_workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|idx| format!("image-decode-{idx}"))
                .build()
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to start {num_workers} decode workers: {err}"
                    ))
                })?;
            Some(pool)
        } else {
            None
        };

        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(pass as u64));
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            dataset,
            transform: ImageTransform::new(resolution),
            device,
            batch_size,
            pool,
            order,
            cursor: 0,
            rng,
            pass,
        })
    }

    pub fn resolution(&self) -> usize {
        self.transform.resolution()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn build_batch(&mut self) -> Result<Option<ImageBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let jobs: Vec<(usize, bool)> = self.order[self.cursor..end]
            .iter()
            .map(|&index| (index, self.rng.gen_bool(0.5)))
            .collect();
        self.cursor = end;

        let rendered = self.render(&jobs)?;
        let batch = rendered.len();
        let resolution = self.transform.resolution();
        let mut pixels = Vec::with_capacity(batch * 3 * resolution * resolution);
        let mut labels = Vec::with_capacity(batch);
        for (values, label) in rendered {
            pixels.extend_from_slice(&values);
            labels.push(label);
        }

        let images = Tensor::from_vec(pixels, (batch, 3, resolution, resolution), &self.device)
            .map_err(to_runtime_error)?;

        Ok(Some(ImageBatch {
            images,
            labels,
            resolution,
            pass: self.pass,
        }))
    }

    fn render(&self, jobs: &[(usize, bool)]) -> Result<Vec<(Vec<f32>, u32)>> {
        let dataset = &self.dataset;
        let transform = self.transform;
        let render_one = move |&(index, flip): &(usize, bool)| -> Result<(Vec<f32>, u32)> {
            let (image, label): (DynamicImage, u32) = dataset.get(index)?;
            Ok((transform.apply(&image, flip), label))
        };

        match &self.pool {
            Some(pool) if jobs.len() > 1 => {
                pool.install(|| jobs.par_iter().map(render_one).collect())
            }
            _ => jobs.iter().map(render_one).collect(),
        }
    }
}

impl DataLoader for ResolutionDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<ImageBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}

/// Supplies batches at the scheduler's resolution, rebuilding the stream when
/// it runs dry.
pub struct DataProvider {
    dataset: Arc<dyn ImageDataset>,
    device: Device,
    num_workers: usize,
    seed: u64,
    loader: BlockingDataLoader<ResolutionDataLoader>,
    passes: usize,
    restarts: usize,
    samples_delivered: usize,
}

impl DataProvider {
    pub fn new(
        dataset: Arc<dyn ImageDataset>,
        resolution: usize,
        batch_size: usize,
        num_workers: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        let loader = ResolutionDataLoader::new(
            Arc::clone(&dataset),
            resolution,
            batch_size,
            num_workers,
            device.clone(),
            seed,
            0,
        )?;
        Ok(Self {
            dataset,
            device,
            num_workers,
            seed,
            loader: BlockingDataLoader::new(loader),
            passes: 1,
            restarts: 0,
            samples_delivered: 0,
        })
    }

    pub fn resolution(&self) -> usize {
        self.loader.inner().resolution()
    }

    pub fn batch_size(&self) -> usize {
        self.loader.inner().batch_size()
    }

    pub fn samples_delivered(&self) -> usize {
        self.samples_delivered
    }

    /// Times the stream was rebuilt because it ran out of samples.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Starts a fresh shuffled stream at a new resolution and batch size.
    pub fn rebuild(&mut self, resolution: usize, batch_size: usize) -> Result<()> {
        let loader = ResolutionDataLoader::new(
            Arc::clone(&self.dataset),
            resolution,
            batch_size,
            self.num_workers,
            self.device.clone(),
            self.seed,
            self.passes,
        )?;
        self.loader = BlockingDataLoader::new(loader);
        self.passes += 1;
        Ok(())
    }

    /// Next batch at the current resolution. An exhausted stream is rebuilt
    /// and retried exactly once; exhaustion on the retry is fatal.
    pub fn next_batch(&mut self) -> Result<ImageBatch> {
        const MAX_RESTARTS: usize = 1;

        let mut attempt = 0;
        loop {
            if let Some(batch) = self.loader.next_batch()? {
                self.samples_delivered += batch.len();
                return Ok(batch);
            }
            if attempt == MAX_RESTARTS {
                return Err(TrainingError::data_exhausted(format!(
                    "no batch at resolution {} after rebuilding the stream",
                    self.resolution()
                )));
            }
            attempt += 1;
            self.restarts += 1;
            let (resolution, batch_size) = (self.resolution(), self.batch_size());
            self.rebuild(resolution, batch_size)?;
        }
    }
}
