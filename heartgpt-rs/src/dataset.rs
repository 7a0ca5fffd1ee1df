//! Instruction dataset loading and batching.

use std::fs::File;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{HeartGptError, Result};
use crate::model::hub_api;

/// File extensions recognised as dataset files, most preferred first.
const DATA_EXTENSIONS: [&str; 4] = ["parquet", "jsonl", "json", "csv"];

/// Rows per Arrow record batch when reading parquet.
const PARQUET_BATCH_ROWS: usize = 1024;

/// Largest number of batches folded into one length-sorted megabatch.
const MAX_MEGABATCH_MULT: usize = 50;

/// A single training example.
///
/// # Example
///
/// ```rust
/// use heartgpt_rs::dataset::Example;
///
/// let example = Example::new("<s>[INST] What is an apple? [/INST] A fruit. </s>");
/// assert!(example.text.starts_with("<s>[INST]"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Full formatted text for training.
    pub text: String,
}

impl Example {
    /// Create an example from its text.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Where a dataset comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// A parquet, JSONL, JSON-array or CSV file on disk.
    Local(PathBuf),
    /// A dataset repository on the hub.
    Hub(String),
}

impl DatasetSource {
    /// An existing local path is a file, anything else is a hub id.
    #[must_use]
    pub fn resolve(name: &str) -> Self {
        let path = Path::new(name);
        if path.exists() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub(name.to_string())
        }
    }
}

/// Training dataset.
///
/// # Example
///
/// ```no_run
/// use heartgpt_rs::dataset::Dataset;
///
/// # fn main() -> heartgpt_rs::Result<()> {
/// let dataset = Dataset::load("adarsha30735/datafood", "train", "text", None, None)?;
/// println!("Loaded {} examples", dataset.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Examples in file order.
    pub examples: Vec<Example>,
    /// Hub id or path the examples were read from.
    pub source: String,
    /// Column the text was taken from.
    pub text_field: String,
}

impl Dataset {
    /// Load `split` of the dataset `name`, reading `text_field` from each row.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset cannot be fetched or a row has no
    /// `text_field`.
    pub fn load(
        name: &str,
        split: &str,
        text_field: &str,
        cache_dir: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self> {
        let paths = match DatasetSource::resolve(name) {
            DatasetSource::Local(path) => vec![path],
            DatasetSource::Hub(repo_id) => fetch_hub_split(&repo_id, split, cache_dir, token)?,
        };
        let mut examples = Vec::new();
        for path in &paths {
            examples.extend(Self::from_file(path, text_field)?.examples);
        }
        let dataset = Self {
            examples,
            source: name.to_string(),
            text_field: text_field.to_string(),
        };
        tracing::info!(
            "Loaded {} examples from {} (split '{}')",
            dataset.len(),
            name,
            split
        );
        Ok(dataset)
    }

    /// Read a local parquet, JSONL, JSON-array or CSV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or a row lacks
    /// `text_field`.
    pub fn from_file(path: &Path, text_field: &str) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let texts = match extension.as_str() {
            "parquet" => texts_from_parquet(path, text_field)?,
            "csv" => texts_from_csv(&std::fs::read_to_string(path)?, text_field)?,
            _ => texts_from_json(&std::fs::read_to_string(path)?, &extension, text_field)?,
        };

        Ok(Self {
            examples: texts.into_iter().map(Example::new).collect(),
            source: path.display().to_string(),
            text_field: text_field.to_string(),
        })
    }

    /// Build a dataset from in-memory texts.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            examples: texts.into_iter().map(Example::new).collect(),
            source: "memory".to_string(),
            text_field: "text".to_string(),
        }
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset has no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

fn text_of(row: &serde_json::Value, field: &str, row_number: usize) -> Result<String> {
    match row.get(field) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(HeartGptError::Dataset(format!(
            "row {row_number}: field '{field}' is not a string: {other}"
        ))),
        None => Err(HeartGptError::Dataset(format!(
            "row {row_number}: missing field '{field}'"
        ))),
    }
}

fn texts_from_json(content: &str, extension: &str, text_field: &str) -> Result<Vec<String>> {
    if extension == "json" && content.trim_start().starts_with('[') {
        let rows: Vec<serde_json::Value> = serde_json::from_str(content)?;
        return rows
            .iter()
            .enumerate()
            .map(|(i, row)| text_of(row, text_field, i + 1))
            .collect();
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let row: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                HeartGptError::Dataset(format!("line {}: invalid JSON: {e}", i + 1))
            })?;
            text_of(&row, text_field, i + 1)
        })
        .collect()
}

/// Read `text_field` from every row of a parquet file.
fn texts_from_parquet(path: &Path, text_field: &str) -> Result<Vec<String>> {
    use arrow_array::cast::AsArray;
    use arrow_array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    if builder.schema().field_with_name(text_field).is_err() {
        return Err(HeartGptError::Dataset(format!(
            "{} has no column '{text_field}'",
            path.display()
        )));
    }
    let reader = builder.with_batch_size(PARQUET_BATCH_ROWS).build()?;

    let mut texts = Vec::new();
    for batch in reader {
        let batch = batch?;
        let column = batch.column_by_name(text_field).ok_or_else(|| {
            HeartGptError::Dataset(format!("record batch lacks column '{text_field}'"))
        })?;
        let values: Vec<Option<&str>> = if let Some(array) = column.as_string_opt::<i32>() {
            array.iter().collect()
        } else if let Some(array) = column.as_string_opt::<i64>() {
            array.iter().collect()
        } else {
            return Err(HeartGptError::Dataset(format!(
                "column '{text_field}' is {}, not a string column",
                column.data_type()
            )));
        };
        for value in values {
            let row_number = texts.len() + 1;
            let text = value.ok_or_else(|| {
                HeartGptError::Dataset(format!("row {row_number}: field '{text_field}' is null"))
            })?;
            texts.push(text.to_string());
        }
    }
    Ok(texts)
}

/// Download the data files backing `split` of a hub dataset.
fn fetch_hub_split(
    repo_id: &str,
    split: &str,
    cache_dir: Option<&str>,
    token: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let api = hub_api(cache_dir, token)?;
    let repo = api.dataset(repo_id.to_string());
    let info = repo.info()?;
    let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
    let chosen = pick_split_files(&files, split);
    if chosen.is_empty() {
        return Err(HeartGptError::Dataset(format!(
            "no .parquet, .jsonl, .json or .csv file for split '{split}' in {repo_id}"
        )));
    }
    chosen
        .into_iter()
        .map(|file| {
            tracing::info!("Fetching {}/{}", repo_id, file);
            Ok(repo.get(file)?)
        })
        .collect()
}

fn extension_of(file: &str) -> Option<String> {
    Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Whether `file` belongs to `split`, by file name or by a directory named
/// after the split (`default/train/0000.parquet`).
fn in_split(file: &str, split: &str) -> bool {
    let path = Path::new(file);
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(split));
    name_matches
        || path
            .parent()
            .is_some_and(|dir| dir.components().any(|c| c.as_os_str() == split))
}

/// Choose the data files for `split` from a repository listing.
///
/// Extensions are tried in [`DATA_EXTENSIONS`] order and every shard of the
/// first one that has files for the split is returned. A repository whose
/// data files name no split serves them all as `train`.
fn pick_split_files<'a>(files: &'a [String], split: &str) -> Vec<&'a str> {
    let with_extension = |ext: &str| -> Vec<&'a str> {
        let mut data: Vec<&'a str> = files
            .iter()
            .map(String::as_str)
            .filter(|f| !f.starts_with('.'))
            .filter(|f| extension_of(f).as_deref() == Some(ext))
            .collect();
        data.sort_unstable();
        data
    };

    for ext in DATA_EXTENSIONS {
        let matching: Vec<&str> = with_extension(ext)
            .into_iter()
            .filter(|f| in_split(f, split))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    if split == "train" {
        if let Some(all) = DATA_EXTENSIONS
            .iter()
            .map(|ext| with_extension(*ext))
            .find(|data| !data.is_empty())
        {
            return all;
        }
    }
    Vec::new()
}

/// Parse CSV text into records, honouring quoted fields with `""` escapes
/// and embedded newlines.
fn parse_csv(content: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(HeartGptError::Dataset("unterminated quoted CSV field".into()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

fn texts_from_csv(content: &str, text_field: &str) -> Result<Vec<String>> {
    let mut records = parse_csv(content)?.into_iter();
    let header = records
        .next()
        .ok_or_else(|| HeartGptError::Dataset("CSV file has no header".into()))?;
    let column = header
        .iter()
        .position(|h| h.trim() == text_field)
        .ok_or_else(|| HeartGptError::Dataset(format!("CSV has no column '{text_field}'")))?;

    records
        .enumerate()
        .filter(|(_, r)| !(r.len() == 1 && r[0].is_empty()))
        .map(|(i, mut r)| {
            if column < r.len() {
                Ok(r.swap_remove(column))
            } else {
                Err(HeartGptError::Dataset(format!(
                    "row {}: missing field '{text_field}'",
                    i + 1
                )))
            }
        })
        .collect()
}

/// Split example indices into batches.
///
/// Without `group_by_length` the batches are sequential chunks. With it the
/// indices are shuffled with `seed`, cut into megabatches that are sorted
/// longest first, and the longest example overall is moved to the first
/// batch so memory peaks on step one.
#[must_use]
pub fn batches(lengths: &[usize], batch_size: usize, group_by_length: bool, seed: u64) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    let order: Vec<usize> = if group_by_length {
        length_grouped_indices(lengths, batch_size, seed)
    } else {
        (0..lengths.len()).collect()
    };
    order.chunks(batch_size).map(<[usize]>::to_vec).collect()
}

fn length_grouped_indices(lengths: &[usize], batch_size: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..lengths.len()).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let mult = (lengths.len() / (batch_size * 4)).clamp(1, MAX_MEGABATCH_MULT);
    let mut megabatches: Vec<Vec<usize>> = indices
        .chunks(mult * batch_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
            chunk
        })
        .collect();

    if let Some(longest) = megabatches
        .iter()
        .enumerate()
        .max_by_key(|(i, mb)| (lengths[mb[0]], std::cmp::Reverse(*i)))
        .map(|(i, _)| i)
    {
        let head = megabatches[longest][0];
        megabatches[longest][0] = megabatches[0][0];
        megabatches[0][0] = head;
    }
    megabatches.into_iter().flatten().collect()
}

/// Concatenate token sequences, each followed by `eos`, and cut the stream
/// into windows of exactly `window` tokens. A trailing partial window is
/// dropped.
#[must_use]
pub fn pack(sequences: &[Vec<u32>], eos: u32, window: usize) -> Vec<Vec<u32>> {
    if window == 0 {
        return Vec::new();
    }
    let stream: Vec<u32> = sequences
        .iter()
        .flat_map(|s| s.iter().copied().chain(std::iter::once(eos)))
        .collect();
    stream.chunks_exact(window).map(<[u32]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_jsonl() {
        let file = file_with(
            ".jsonl",
            "{\"text\": \"<s>[INST] a [/INST] b </s>\"}\n\n{\"text\": \"second\", \"extra\": 1}\n",
        );
        let dataset = Dataset::from_file(file.path(), "text").unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.examples[1].text, "second");
        assert_eq!(dataset.text_field, "text");
    }

    #[test]
    fn test_load_json_array() {
        let file = file_with(".json", r#"[{"text": "one"}, {"text": "two"}]"#);
        let dataset = Dataset::from_file(file.path(), "text").unwrap();
        assert_eq!(dataset.len(), 2);
    }

    #[test]
    fn test_missing_text_field() {
        let file = file_with(".jsonl", "{\"text\": \"ok\"}\n{\"prompt\": \"no\"}\n");
        let err = Dataset::from_file(file.path(), "text").unwrap_err();
        assert!(err.to_string().contains("row 2"));
        assert!(err.to_string().contains("missing field 'text'"));
    }

    #[test]
    fn test_non_string_text_field() {
        let file = file_with(".jsonl", "{\"text\": 3}\n");
        assert!(Dataset::from_file(file.path(), "text").is_err());
    }

    #[test]
    fn test_malformed_jsonl() {
        let file = file_with(".jsonl", "{\"text\": \"ok\"}\n{not json}\n");
        let err = Dataset::from_file(file.path(), "text").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_empty_file_loads_empty_dataset() {
        let file = file_with(".jsonl", "");
        let dataset = Dataset::from_file(file.path(), "text").unwrap();
        assert!(dataset.is_empty());
    }

    #[test]
    fn test_load_csv_with_quotes() {
        let file = file_with(
            ".csv",
            "id,text\n1,\"<s>[INST] Food Code:1, grams [/INST] Heart-healthy </s>\"\n2,\"say \"\"hi\"\"\nthere\"\n",
        );
        let dataset = Dataset::from_file(file.path(), "text").unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.examples[0].text.contains("Food Code:1, grams"));
        assert_eq!(dataset.examples[1].text, "say \"hi\"\nthere");
    }

    #[test]
    fn test_csv_missing_column() {
        let file = file_with(".csv", "id,prompt\n1,x\n");
        assert!(Dataset::from_file(file.path(), "text").is_err());
    }

    #[test]
    fn test_unterminated_csv_quote() {
        assert!(parse_csv("a\n\"open").is_err());
    }

    #[test]
    fn test_source_resolution() {
        let file = file_with(".jsonl", "");
        assert_eq!(
            DatasetSource::resolve(file.path().to_str().unwrap()),
            DatasetSource::Local(file.path().to_path_buf())
        );
        assert_eq!(
            DatasetSource::resolve("adarsha30735/datafood"),
            DatasetSource::Hub("adarsha30735/datafood".into())
        );
    }

    fn listing(files: &[&str]) -> Vec<String> {
        files.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_pick_split_files() {
        let files = listing(&[".gitattributes", "README.md", "data/test.csv", "data/train.csv"]);
        assert_eq!(pick_split_files(&files, "train"), vec!["data/train.csv"]);
        assert_eq!(pick_split_files(&files, "test"), vec!["data/test.csv"]);
        assert!(pick_split_files(&files, "validation").is_empty());

        let unnamed = listing(&["README.md", "food.csv"]);
        assert_eq!(pick_split_files(&unnamed, "train"), vec!["food.csv"]);
    }

    #[test]
    fn test_pick_split_files_prefers_parquet_shards() {
        let files = listing(&[
            "README.md",
            "data/train-00001-of-00002.parquet",
            "data/train-00000-of-00002.parquet",
            "data/test-00000-of-00001.parquet",
            "train.jsonl",
        ]);
        assert_eq!(
            pick_split_files(&files, "train"),
            vec!["data/train-00000-of-00002.parquet", "data/train-00001-of-00002.parquet"]
        );
        assert_eq!(pick_split_files(&files, "test"), vec!["data/test-00000-of-00001.parquet"]);

        let only_parquet = listing(&[".gitattributes", "data/train-00000-of-00001.parquet"]);
        assert_eq!(
            pick_split_files(&only_parquet, "train"),
            vec!["data/train-00000-of-00001.parquet"]
        );

        let by_directory = listing(&["default/train/0000.parquet", "default/test/0000.parquet"]);
        assert_eq!(pick_split_files(&by_directory, "test"), vec!["default/test/0000.parquet"]);
    }

    fn write_parquet(path: &Path, column: &str, values: Vec<Option<&str>>) {
        use std::sync::Arc;

        use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
        use arrow_schema::{DataType, Field, Schema};
        use parquet::arrow::ArrowWriter;

        let ids: Vec<i64> = (0..values.len() as i64).collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new(column, DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int64Array::from(ids)) as ArrayRef,
                Arc::new(StringArray::from(values)) as ArrayRef,
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_load_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train-00000-of-00001.parquet");
        write_parquet(
            &path,
            "text",
            vec![Some("<s>[INST] apple [/INST] Heart-healthy </s>"), Some("second")],
        );

        let dataset = Dataset::from_file(&path, "text").unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.examples[0].text.contains("Heart-healthy"));
        assert_eq!(dataset.examples[1].text, "second");
    }

    #[test]
    fn test_parquet_missing_column_and_null_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.parquet");
        write_parquet(&path, "prompt", vec![Some("x")]);
        let err = Dataset::from_file(&path, "text").unwrap_err();
        assert!(err.to_string().contains("no column 'text'"));

        let path = dir.path().join("nulls.parquet");
        write_parquet(&path, "text", vec![Some("ok"), None]);
        let err = Dataset::from_file(&path, "text").unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_sequential_batches() {
        let batches = batches(&[5, 1, 3, 2, 4], 2, false, 42);
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_grouped_batches_cover_every_index_once() {
        let lengths: Vec<usize> = (0..37).map(|i| (i * 7) % 23).collect();
        let grouped = batches(&lengths, 4, true, 42);
        let mut seen: Vec<usize> = grouped.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..37).collect::<Vec<_>>());
        assert!(grouped.iter().all(|b| b.len() <= 4));
    }

    #[test]
    fn test_grouped_batches_put_longest_first() {
        let lengths: Vec<usize> = (0..100).collect();
        let grouped = batches(&lengths, 4, true, 7);
        assert_eq!(grouped[0][0], 99);
    }

    #[test]
    fn test_grouped_batches_are_seeded() {
        let lengths: Vec<usize> = (0..64).map(|i| i % 9).collect();
        assert_eq!(batches(&lengths, 4, true, 1), batches(&lengths, 4, true, 1));
    }

    #[test]
    fn test_pack_windows() {
        let packed = pack(&[vec![1, 2, 3], vec![4, 5]], 0, 3);
        assert_eq!(packed, vec![vec![1, 2, 3], vec![0, 4, 5]]);
        assert!(pack(&[vec![1]], 0, 0).is_empty());
    }
}
