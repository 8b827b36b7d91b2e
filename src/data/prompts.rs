//! Prompt corpus loading
//!
//! Prompts come either from a local file or from a dataset on the hub.
//! Hub datasets are read from their parquet conversion, which every public
//! dataset repo carries under the `refs/convert/parquet` revision.

use anyhow::{bail, Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use log::info;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DatasetError;

const PARQUET_REVISION: &str = "refs/convert/parquet";
const COCO_META_DATA: &str = "fid_outputs/coco/meta_data.json";

/// Where a corpus lives and which field holds the prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSource {
    pub name: String,
    pub prompt_key: String,
    pub split: String,
}

impl CorpusSource {
    /// Resolve the prompt key and split from a dataset name.
    pub fn resolve(name: &str) -> Self {
        let (prompt_key, split) = if name.contains("laion") {
            ("TEXT", "train")
        } else if name.contains("coco") {
            ("caption", "annotations")
        } else {
            ("Prompt", "test")
        };
        Self {
            name: name.to_string(),
            prompt_key: prompt_key.to_string(),
            split: split.to_string(),
        }
    }
}

/// Ordered list of prompts indexed by dataset position.
#[derive(Debug, Clone)]
pub struct PromptCorpus {
    prompts: Vec<String>,
    prompt_key: String,
}

impl PromptCorpus {
    pub fn from_prompts(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            prompt_key: "Prompt".to_string(),
        }
    }

    /// Load a corpus by dataset name or local path.
    pub fn load(dataset: &str) -> Result<Self> {
        let source = CorpusSource::resolve(dataset);
        let local = Path::new(dataset);

        let prompts = if local.is_file() {
            load_local_file(local, &source.prompt_key)?
        } else if dataset.contains("coco") {
            load_coco_annotations(Path::new(COCO_META_DATA), &source.prompt_key)?
        } else {
            let path = fetch_hub_parquet(&source)?;
            load_parquet(&path, &source.prompt_key)?
        };

        info!(
            "Loaded {} prompts from {} (key `{}`)",
            prompts.len(),
            dataset,
            source.prompt_key
        );

        Ok(Self {
            prompts,
            prompt_key: source.prompt_key,
        })
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompt_key(&self) -> &str {
        &self.prompt_key
    }

    pub fn get(&self, index: usize) -> Result<&str, DatasetError> {
        self.prompts
            .get(index)
            .map(String::as_str)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.prompts.len(),
            })
    }
}

fn load_local_file(path: &Path, key: &str) -> Result<Vec<String>> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("parquet") => load_parquet(path, key),
        Some("jsonl") => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
            let mut prompts = Vec::new();
            for (record, line) in text.lines().filter(|l| !l.trim().is_empty()).enumerate() {
                let value: serde_json::Value = serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSON on record {} of {}", record, path.display()))?;
                prompts.push(prompt_field(&value, key, record)?);
            }
            Ok(prompts)
        }
        Some("json") => load_coco_annotations(path, key),
        _ => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
            Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect())
        }
    }
}

/// Reads a JSON document that is either an array of records or an object
/// with an `annotations` array (the COCO meta data layout).
fn load_coco_annotations(path: &Path, key: &str) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    let records = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => match map.get("annotations") {
            Some(serde_json::Value::Array(items)) => items,
            _ => bail!("{} has no `annotations` array", path.display()),
        },
        _ => bail!("{} is neither a JSON array nor an object", path.display()),
    };

    records
        .iter()
        .enumerate()
        .map(|(record, value)| Ok(prompt_field(value, key, record)?))
        .collect()
}

fn prompt_field(value: &serde_json::Value, key: &str, record: usize) -> Result<String, DatasetError> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| DatasetError::MissingPromptKey {
            key: key.to_string(),
            record,
        })
}

fn fetch_hub_parquet(source: &CorpusSource) -> Result<PathBuf> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        source.name.clone(),
        RepoType::Dataset,
        PARQUET_REVISION.to_string(),
    ));
    let file = format!("default/{}/0000.parquet", source.split);
    info!("Fetching prompt corpus {}:{}", source.name, file);
    repo.get(&file)
        .with_context(|| format!("Failed to fetch {} from dataset {}", file, source.name))
}

fn load_parquet(path: &Path, key: &str) -> Result<Vec<String>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open parquet file: {}", path.display()))?;
    let reader = SerializedFileReader::new(file)?;

    let mut prompts = Vec::new();
    for (record, row) in reader.get_row_iter(None)?.enumerate() {
        let row = row?;
        let text = row
            .get_column_iter()
            .find(|(name, _)| name.as_str() == key)
            .and_then(|(_, field)| match field {
                Field::Str(s) => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| DatasetError::MissingPromptKey {
                key: key.to_string(),
                record,
            })?;
        prompts.push(text);
    }
    Ok(prompts)
}
