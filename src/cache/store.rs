use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// One cached listings row. Matches the upstream schema used by the
/// original deployment's CSV cache files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub year: u32,
    pub make: String,
    pub model: String,
    pub price: f64,
    pub mileage: f64,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheFileMeta {
    pub filename: String,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
    pub row_count: usize,
}

/// Reads and writes this node's local cache directory. Every node keeps its
/// own `cache/node_<id>/` directory of per-query CSV files; the reconciler
/// is the only thing that copies files between nodes, so `CacheStore` itself
/// has no notion of peers.
pub struct CacheStore {
    dir: PathBuf,
    ttl: chrono::Duration,
}

impl CacheStore {
    pub async fn new(data_dir: &str, node_id: u64, ttl_hours: i64) -> Result<Self> {
        let dir = Path::new(data_dir).join(format!("cache/node_{node_id}"));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
        Ok(CacheStore { dir, ttl: chrono::Duration::hours(ttl_hours) })
    }

    /// Derives the on-disk filename for a query, matching the original's
    /// `<make>_<model>_<city>.csv` convention, lowercased and space-collapsed
    /// so two differently-cased requests for the same car hit the same file.
    pub fn fingerprint(make: &str, model: &str, city: &str) -> String {
        let normalize = |s: &str| s.trim().to_lowercase().replace(' ', "_");
        format!("{}_{}_{}.csv", normalize(make), normalize(model), normalize(city))
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub async fn read_listings(&self, filename: &str) -> Result<Vec<Listing>> {
        let path = self.path_for(filename);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading cache file {}", path.display()))?;
        parse_csv(&bytes)
    }

    pub async fn write_listings(&self, filename: &str, listings: &[Listing]) -> Result<()> {
        let bytes = encode_csv(listings)?;
        self.write_bytes(filename, &bytes).await
    }

    async fn write_bytes(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(filename);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing cache file {}", path.display()))
    }

    /// Entry point used by the consensus apply loop: write raw replicated
    /// bytes verbatim, without re-parsing them as CSV. A follower applying
    /// a `ReplicateFile` command trusts the leader's bytes exactly.
    pub async fn write_replicated_file(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        self.write_bytes(filename, bytes).await
    }

    pub async fn read_raw(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_for(filename);
        fs::read(&path)
            .await
            .with_context(|| format!("reading cache file {}", path.display()))
    }

    pub async fn exists(&self, filename: &str) -> bool {
        fs::metadata(self.path_for(filename)).await.is_ok()
    }

    /// `None` if the file does not exist; `Some(true)` if its mtime is
    /// within the configured TTL.
    pub async fn is_fresh(&self, filename: &str) -> Result<Option<bool>> {
        let path = self.path_for(filename);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("reading cache file metadata"),
        };
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Some(Utc::now() - modified < self.ttl))
    }

    pub async fn list_files(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn meta_for(&self, filename: &str) -> Result<CacheFileMeta> {
        let path = self.path_for(filename);
        let meta = fs::metadata(&path)
            .await
            .with_context(|| format!("reading cache file metadata {}", path.display()))?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let row_count = self.read_listings(filename).await.map(|l| l.len()).unwrap_or(0);
        Ok(CacheFileMeta { filename: filename.to_string(), modified, size_bytes: meta.len(), row_count })
    }
}

fn parse_csv(bytes: &[u8]) -> Result<Vec<Listing>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut listings = Vec::new();
    for record in reader.deserialize() {
        listings.push(record.context("parsing cache CSV row")?);
    }
    Ok(listings)
}

fn encode_csv(listings: &[Listing]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for listing in listings {
        writer.serialize(listing).context("writing cache CSV row")?;
    }
    writer.flush()?;
    writer.into_inner().map_err(|e| anyhow::anyhow!("csv writer flush failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Listing> {
        vec![
            Listing { year: 2019, make: "Toyota".into(), model: "Corolla".into(), price: 15000.0, mileage: 32000.0, location: "Ottawa".into() },
            Listing { year: 2021, make: "Toyota".into(), model: "Corolla".into(), price: 19500.0, mileage: 8000.0, location: "Ottawa".into() },
        ]
    }

    #[tokio::test]
    async fn writes_and_reads_listings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 217, 24).await.unwrap();
        let filename = CacheStore::fingerprint("Toyota", "Corolla", "Ottawa");
        store.write_listings(&filename, &sample()).await.unwrap();

        let back = store.read_listings(&filename).await.unwrap();
        assert_eq!(back, sample());
    }

    #[tokio::test]
    async fn fingerprint_normalizes_case_and_whitespace() {
        assert_eq!(
            CacheStore::fingerprint("Toyota", "Corolla", "Ottawa"),
            CacheStore::fingerprint(" toyota ", "corolla", "OTTAWA")
        );
    }

    #[tokio::test]
    async fn is_fresh_returns_none_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 217, 24).await.unwrap();
        assert_eq!(store.is_fresh("missing.csv").await.unwrap(), None);
    }

    #[tokio::test]
    async fn freshly_written_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 217, 24).await.unwrap();
        let filename = CacheStore::fingerprint("Honda", "Civic", "Gatineau");
        store.write_listings(&filename, &sample()).await.unwrap();
        assert_eq!(store.is_fresh(&filename).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn list_files_returns_sorted_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_str().unwrap(), 217, 24).await.unwrap();
        store.write_listings("b.csv", &sample()).await.unwrap();
        store.write_listings("a.csv", &sample()).await.unwrap();
        assert_eq!(store.list_files().await.unwrap(), vec!["a.csv".to_string(), "b.csv".to_string()]);
    }
}
