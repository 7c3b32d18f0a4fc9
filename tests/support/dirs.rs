use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use cacheproxy::proxy::cache::derive_key;

/// Scratch space for one test; removed on drop.
pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");
        Ok(Self {
            _temp: temp,
            cache_dir,
        })
    }

    pub fn body_path(&self, resource: &str) -> PathBuf {
        self.cache_dir.join(derive_key(resource).as_str())
    }

    pub fn headers_path(&self, resource: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.headers", derive_key(resource).as_str()))
    }

    pub fn cache_files(&self) -> Result<Vec<String>> {
        list_files(&self.cache_dir)
    }
}

fn list_files(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}
