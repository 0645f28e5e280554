use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{Error, Result};

/// Documents for one bucket, by key.
pub type BucketDocs = BTreeMap<String, Value>;

/// Seed documents kept on disk, one `<bucket>.json` file per bucket.
///
/// Dumps are written to a temporary file in the same directory and renamed into
/// place, so a crash never leaves a half-written fixture behind.
pub struct Fixtures {
    data_dir: PathBuf,
}

impl Fixtures {
    /// Opens a fixture directory, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self { data_dir: dir })
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", bucket))
    }

    /// Writes one bucket's documents atomically.
    pub fn save_bucket(&self, bucket: &str, docs: &BucketDocs) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(docs)?;

        let mut tmp = NamedTempFile::new_in(&self.data_dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(self.bucket_path(bucket)).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// Loads one bucket's documents. A missing file is an empty bucket.
    pub fn load_bucket(&self, bucket: &str) -> Result<BucketDocs> {
        let path = self.bucket_path(bucket);
        if !path.exists() {
            return Ok(BucketDocs::new());
        }
        let content = fs::read(&path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Loads every bucket file in the directory, skipping unreadable ones.
    pub fn load_all(&self) -> Result<HashMap<String, BucketDocs>> {
        let mut all = HashMap::new();

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let bucket = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Error::Internal("Invalid filename".to_string()))?
                .to_string();

            let content = match fs::read(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Could not read fixture file {:?}: {}", path, e);
                    continue;
                }
            };

            match serde_json::from_slice::<BucketDocs>(&content) {
                Ok(docs) => {
                    all.insert(bucket, docs);
                }
                Err(e) => warn!("Could not parse fixture documents from {:?}: {}", path, e),
            }
        }

        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn docs() -> BucketDocs {
        let mut docs = BucketDocs::new();
        docs.insert("doc::1".to_string(), json!({"id": 1, "text": "A string"}));
        docs
    }

    #[test]
    fn test_save_and_load_bucket() {
        let dir = tempdir().unwrap();
        let fixtures = Fixtures::new(dir.path()).unwrap();

        fixtures.save_bucket("default", &docs()).unwrap();

        let loaded = fixtures.load_bucket("default").unwrap();
        assert_eq!(loaded, docs());
        assert!(dir.path().join("default.json").exists());
    }

    #[test]
    fn test_missing_bucket_is_empty() {
        let dir = tempdir().unwrap();
        let fixtures = Fixtures::new(dir.path()).unwrap();
        assert!(fixtures.load_bucket("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_load_all_skips_bad_files() {
        let dir = tempdir().unwrap();
        let fixtures = Fixtures::new(dir.path()).unwrap();
        fixtures.save_bucket("good", &docs()).unwrap();
        fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let all = fixtures.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["good"]["doc::1"], json!({"id": 1, "text": "A string"}));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let fixtures = Fixtures::new(dir.path()).unwrap();
        fixtures.save_bucket("default", &docs()).unwrap();
        fixtures.save_bucket("default", &docs()).unwrap();

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
