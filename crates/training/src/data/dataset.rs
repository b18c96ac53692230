use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{imageops::FilterType, DynamicImage};

use super::Result;
use crate::config::{DatasetKind, TrainingError};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "webp", "gif"];

/// Random-access source of labelled images.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<(DynamicImage, u32)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens the dataset layout named by `kind` rooted at `path`.
pub fn open_dataset(path: &Path, kind: DatasetKind) -> Result<Box<dyn ImageDataset>> {
    match kind {
        DatasetKind::Folder => Ok(Box::new(ImageFolder::open(path)?)),
        DatasetKind::Lsun => Ok(Box::new(LsunClass::open(path)?)),
    }
}

/// `root/<class>/<image>` layout; labels are the sorted class indices.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, u32)>,
}

impl ImageFolder {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut class_dirs = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                class_dirs.push(entry.path());
            }
        }
        class_dirs.sort();

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut samples = Vec::new();
        for (label, dir) in class_dirs.iter().enumerate() {
            let mut files = Vec::new();
            collect_images(dir, false, &mut files)?;
            files.sort();
            samples.extend(files.into_iter().map(|path| (path, label as u32)));
            classes.push(
                dir.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
        }

        if samples.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no images found under class directories of {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl ImageDataset for ImageFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, u32)> {
        let (path, label) = self.samples.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "image index {index} out of range ({} samples)",
                self.samples.len()
            ))
        })?;
        Ok((decode(path)?, *label))
    }
}

/// One exported LSUN category: every image below `root`, all labelled 0.
#[derive(Debug, Clone)]
pub struct LsunClass {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl LsunClass {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut files = Vec::new();
        collect_images(&root, true, &mut files)?;
        files.sort();
        if files.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no images found in LSUN export {}",
                root.display()
            )));
        }
        Ok(Self { root, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ImageDataset for LsunClass {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, u32)> {
        let path = self.files.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "image index {index} out of range ({} samples)",
                self.files.len()
            ))
        })?;
        Ok((decode(path)?, 0))
    }
}

/// Images held in memory, mostly useful for tests and small experiments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    items: Vec<(DynamicImage, u32)>,
}

impl InMemoryDataset {
    pub fn new(items: Vec<(DynamicImage, u32)>) -> Self {
        Self { items }
    }
}

impl ImageDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, u32)> {
        self.items.get(index).cloned().ok_or_else(|| {
            TrainingError::runtime(format!(
                "image index {index} out of range ({} samples)",
                self.items.len()
            ))
        })
    }
}

fn collect_images(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if recursive {
                collect_images(&path, true, out)?;
            }
        } else if has_image_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn decode(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to decode {}: {}", path.display(), err))
    })
}

/// Renders a decoded image at one square resolution, in `[-1, 1]` CHW layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    resolution: usize,
}

impl ImageTransform {
    pub fn new(resolution: usize) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// Resize the shorter side, centre-crop, optionally mirror, then normalise
    /// each channel with mean 0.5 and std 0.5.
    pub fn apply(&self, image: &DynamicImage, flip: bool) -> Vec<f32> {
        let size = self.resolution as u32;
        let (width, height) = (image.width().max(1), image.height().max(1));
        let scale = size as f64 / width.min(height) as f64;
        let scaled_w = ((width as f64 * scale).round() as u32).max(size);
        let scaled_h = ((height as f64 * scale).round() as u32).max(size);

        let resized = image.resize_exact(scaled_w, scaled_h, FilterType::Triangle);
        let left = (scaled_w - size) / 2;
        let top = (scaled_h - size) / 2;
        let mut cropped = resized.crop_imm(left, top, size, size);
        if flip {
            cropped = cropped.fliph();
        }

        let rgb = cropped.to_rgb8();
        let plane = self.resolution * self.resolution;
        let mut chw = vec![0f32; plane * 3];
        for (idx, pixel) in rgb.pixels().enumerate() {
            for channel in 0..3 {
                let value = pixel.0[channel] as f32 / 255.0;
                chw[channel * plane + idx] = (value - 0.5) / 0.5;
            }
        }
        chw
    }
}
