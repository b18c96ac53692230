use std::{fs, path::PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use model::{Generator, LatentInput};

use crate::{
    config::{to_runtime_error, SampleConfig, TrainingError},
    latent::LatentSampler,
    scheduler::ResolutionTable,
};

const DEFAULT_GRID: [usize; 2] = [10, 5];
const PADDING: u32 = 2;

/// Writes preview grids rendered by the averaged generator. Latent codes come
/// from a dedicated sampler so previews never shift the training draws.
#[derive(Debug)]
pub struct SampleWriter {
    directory: PathBuf,
    every_n_iters: usize,
    grids: ResolutionTable<[usize; 2]>,
    latents: LatentSampler,
}

impl SampleWriter {
    pub fn from_config(
        config: &SampleConfig,
        code_size: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            directory: config.directory.clone(),
            every_n_iters: config.every_n_iters.max(1),
            grids: ResolutionTable::new(
                config
                    .grid
                    .iter()
                    .map(|entry| (entry.resolution, entry.value)),
            ),
            latents: LatentSampler::new(code_size, None, device, seed)?,
        })
    }

    pub fn is_due(&self, iteration: usize) -> bool {
        (iteration + 1) % self.every_n_iters == 0
    }

    /// `[columns, rows]` of the grid rendered at `resolution`.
    pub fn grid_for(&self, resolution: usize) -> [usize; 2] {
        self.grids.get_or(resolution, DEFAULT_GRID)
    }

    /// Renders `columns` batches of `rows` codes; batch `i` fills column `i`.
    pub fn write<G: Generator + ?Sized>(
        &mut self,
        generator: &G,
        iteration: usize,
        step: usize,
        alpha: f64,
    ) -> Result<PathBuf, TrainingError> {
        let resolution = model::resolution_for_step(step);
        let [cols, rows] = self.grid_for(resolution);

        let mut columns = Vec::with_capacity(cols);
        for _ in 0..cols {
            let codes = self.latents.codes(rows)?;
            let images = generator
                .forward(&LatentInput::Single(codes), step, alpha)
                .map_err(to_runtime_error)?;
            columns.push(images.detach());
        }
        // [cols, rows, ...] -> row-major [rows, cols, ...]
        let images = Tensor::stack(&columns, 0)
            .and_then(|stacked| stacked.transpose(0, 1))
            .and_then(|swapped| swapped.contiguous())
            .and_then(|tiles| tiles.flatten_to(1))
            .map_err(to_runtime_error)?;
        let grid = render_grid(&images, rows, cols)?;

        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create sample directory {}: {err}",
                self.directory.display()
            ))
        })?;
        let path = self.directory.join(format!("{:06}.png", iteration + 1));
        grid.save(&path).map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

/// Tiles a `[rows * cols, 3, h, w]` batch in `[-1, 1]` into one 8-bit image.
pub fn render_grid(images: &Tensor, rows: usize, cols: usize) -> Result<RgbImage, TrainingError> {
    let (count, channels, height, width) = images.dims4().map_err(to_runtime_error)?;
    if channels != 3 || count < rows * cols {
        return Err(TrainingError::runtime(format!(
            "cannot tile {count} images with {channels} channels into a {rows}x{cols} grid"
        )));
    }
    let values = images
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;

    let (h, w) = (height as u32, width as u32);
    let grid_w = cols as u32 * (w + PADDING) + PADDING;
    let grid_h = rows as u32 * (h + PADDING) + PADDING;
    let mut grid = RgbImage::new(grid_w, grid_h);

    let plane = height * width;
    for idx in 0..rows * cols {
        let origin_x = PADDING + (idx % cols) as u32 * (w + PADDING);
        let origin_y = PADDING + (idx / cols) as u32 * (h + PADDING);
        let base = idx * 3 * plane;
        for y in 0..height {
            for x in 0..width {
                let offset = base + y * width + x;
                let pixel = Rgb([
                    to_u8(values[offset]),
                    to_u8(values[offset + plane]),
                    to_u8(values[offset + 2 * plane]),
                ]);
                grid.put_pixel(origin_x + x as u32, origin_y + y as u32, pixel);
            }
        }
    }
    Ok(grid)
}

fn to_u8(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0).round() as u8
}
