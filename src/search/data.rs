//! In-memory image datasets and mini-batches

use ndarray::{Array4, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{DartsError, Result};

/// A mini-batch of `[N, C, H, W]` images and their class labels
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub input: Array4<f64>,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn new(input: Array4<f64>, targets: Vec<usize>) -> Result<Self> {
        if input.dim().0 != targets.len() {
            return Err(DartsError::shape(format!("{} targets", input.dim().0), format!("{}", targets.len())));
        }
        Ok(Self { input, targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Labelled images held in memory
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array4<f64>,
    labels: Vec<usize>,
    num_classes: usize,
}

impl Dataset {
    pub fn new(images: Array4<f64>, labels: Vec<usize>, num_classes: usize) -> Result<Self> {
        if images.dim().0 != labels.len() {
            return Err(DartsError::shape(format!("{} labels", images.dim().0), format!("{}", labels.len())));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(DartsError::InvalidInput(format!("label {} out of range for {} classes", bad, num_classes)));
        }
        Ok(Self { images, labels, num_classes })
    }

    /// Class-conditional Gaussian images: each class has a random template and
    /// samples are the template plus unit noise scaled by `noise`
    pub fn synthetic(
        samples: usize,
        num_classes: usize,
        channels: usize,
        size: usize,
        noise: f64,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(DartsError::InvalidInput("synthetic data needs at least one class".to_string()));
        }
        let templates =
            Array4::from_shape_simple_fn((num_classes, channels, size, size), || rng.sample::<f64, _>(StandardNormal));
        let labels: Vec<usize> = (0..samples).map(|_| rng.gen_range(0..num_classes)).collect();
        let mut images = Array4::zeros((samples, channels, size, size));
        for (mut image, &label) in images.outer_iter_mut().zip(&labels) {
            image.assign(&templates.index_axis(Axis(0), label));
            image.mapv_inplace(|v| v + noise * rng.sample::<f64, _>(StandardNormal));
        }
        Self::new(images, labels, num_classes)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `[C, H, W]` of one image
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let (_, c, h, w) = self.images.dim();
        (c, h, w)
    }

    /// Gather the samples at `indices`
    pub fn batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(DartsError::InvalidInput(format!("sample {} out of range for {} samples", bad, self.len())));
        }
        let input = self.images.select(Axis(0), indices);
        let targets = indices.iter().map(|&i| self.labels[i]).collect();
        Batch::new(input, targets)
    }

    /// Split into the first `portion` of samples and the rest
    pub fn split(&self, portion: f64) -> Result<(Dataset, Dataset)> {
        if !(0.0..=1.0).contains(&portion) {
            return Err(DartsError::InvalidParameter {
                name: "train_portion".to_string(),
                value: portion.to_string(),
                reason: "must lie in [0, 1]".to_string(),
            });
        }
        let cut = (portion * self.len() as f64).floor() as usize;
        let head: Vec<usize> = (0..cut).collect();
        let tail: Vec<usize> = (cut..self.len()).collect();
        let part = |indices: &[usize]| -> Result<Dataset> {
            let batch = self.batch(indices)?;
            Dataset::new(batch.input, batch.targets, self.num_classes)
        };
        Ok((part(&head)?, part(&tail)?))
    }

    /// Shuffled mini-batches covering every sample once; the last may be short
    pub fn batches(&self, batch_size: usize, rng: &mut impl Rng) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(DartsError::InvalidParameter {
                name: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order.chunks(batch_size).map(|chunk| self.batch(chunk)).collect()
    }
}
