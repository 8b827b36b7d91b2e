//! Shuffling batch loader over an [`OptimizedDataset`]

use anyhow::Result;
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use super::optimized_dataset::{Example, OptimizedDataset};

/// A collated batch
#[derive(Debug, Clone)]
pub struct Batch {
    pub prompts: Vec<String>,
    /// `[B, 3, size, size]`
    pub pixel_values: Tensor,
}

pub struct DataLoader {
    dataset: OptimizedDataset,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: OptimizedDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let order = (0..dataset.len()).collect();
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            order,
            cursor: 0,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        loader.reshuffle();
        loader
    }

    pub fn dataset(&self) -> &OptimizedDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Number of batches per epoch, the last one possibly partial.
    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Next batch, starting a new (reshuffled) epoch when the current one is exhausted.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor >= self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
            self.reshuffle();
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let examples = indices
            .par_iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<Example>>>()?;

        collate(examples)
    }

    fn reshuffle(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}

fn collate(examples: Vec<Example>) -> Result<Batch> {
    let mut prompts = Vec::with_capacity(examples.len());
    let mut pixels = Vec::with_capacity(examples.len());
    for example in examples {
        prompts.push(example.prompt);
        pixels.push(example.pixel_values);
    }
    Ok(Batch {
        prompts,
        pixel_values: Tensor::stack(&pixels, 0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::optimized_dataset::{DatasetConfig, Split};
    use crate::data::prompts::PromptCorpus;
    use candle_core::Device;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn dataset(dir: &TempDir, images: usize, split: Split) -> OptimizedDataset {
        for i in 0..images {
            RgbImage::from_pixel(4, 4, Rgb([i as u8 * 20, 0, 0]))
                .save(dir.path().join(format!("ori-lg7.5-{}.png", i)))
                .unwrap();
        }
        let mut config = DatasetConfig::new(dir.path());
        config.size = 4;
        config.repeats = 2;
        config.split = split;
        let prompts = PromptCorpus::from_prompts((0..images).map(|i| format!("p{}", i)).collect());
        OptimizedDataset::new(config, prompts, Device::Cpu).unwrap()
    }

    #[test]
    fn test_epoch_covers_every_item() -> Result<()> {
        let dir = TempDir::new()?;
        let mut loader = DataLoader::new(dataset(&dir, 3, Split::Test), 2, true, 7);
        assert_eq!(loader.batches_per_epoch(), 2);

        let first = loader.next_batch()?;
        let second = loader.next_batch()?;
        assert_eq!(first.pixel_values.dims(), &[2, 3, 4, 4]);
        assert_eq!(second.pixel_values.dims(), &[1, 3, 4, 4]);

        let seen: HashSet<String> = first.prompts.into_iter().chain(second.prompts).collect();
        assert_eq!(seen.len(), 3);

        loader.next_batch()?;
        assert_eq!(loader.epoch(), 1);
        Ok(())
    }

    #[test]
    fn test_unshuffled_order() -> Result<()> {
        let dir = TempDir::new()?;
        let mut loader = DataLoader::new(dataset(&dir, 2, Split::Train), 4, false, 0);
        let batch = loader.next_batch()?;
        assert_eq!(batch.prompts, vec!["p0", "p1", "p0", "p1"]);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_order() -> Result<()> {
        let dir = TempDir::new()?;
        let mut a = DataLoader::new(dataset(&dir, 3, Split::Train), 6, true, 42);
        let mut b = DataLoader::new(dataset(&dir, 3, Split::Train), 6, true, 42);
        assert_eq!(a.next_batch()?.prompts, b.next_batch()?.prompts);
        Ok(())
    }
}
