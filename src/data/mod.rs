pub mod image_utils;
pub mod loader;
pub mod optimized_dataset;
pub mod prompts;

pub use loader::{Batch, DataLoader};
pub use optimized_dataset::{DatasetConfig, Example, Interpolation, OptimizedDataset, Split};
pub use prompts::PromptCorpus;
