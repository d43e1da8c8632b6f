// Content-addressed downloader for submission code, executables and testcases
//
// Cache layout: `<cache_root>/<name>/content` plus `<name>/checksum`.
// Hits are hard-linked to the destination. Every cache-layer failure is
// logged and falls back to a direct download.

use crate::endpoint::HttpEndpoint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use judgehost_common::api::{self, TestcasePart};
use judgehost_common::types::SubmissionFile;
use md5::{Digest, Md5};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CACHE_CONTENT: &str = "content";
const CACHE_CHECKSUM: &str = "checksum";

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("checksum error, file corrupted during download: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("content is not valid base64")]
    Decode(#[from] base64::DecodeError),
    #[error("submission has no files")]
    EmptySubmission,
    #[error("server assigned an unusable filename `{0}`")]
    BadFilename(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchKind {
    Code { submit_id: i64 },
    Executable { exec_id: String },
    Testcase { testcase_id: i64, part: TestcasePart },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    /// Lowercase or uppercase hex md5.
    Md5(String),
    Skip,
}

impl Checksum {
    fn expected(&self) -> Option<&str> {
        match self {
            Checksum::Md5(hex) => Some(hex.as_str()),
            Checksum::Skip => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: FetchKind,
    /// For code, only the directory is honoured; the file name comes from the server.
    pub destination: PathBuf,
    pub checksum: Checksum,
    pub use_cache: bool,
}

impl FetchRequest {
    pub fn code(submit_id: i64, dir: &Path) -> Self {
        Self {
            kind: FetchKind::Code { submit_id },
            destination: dir.join("submission"),
            checksum: Checksum::Skip,
            use_cache: false,
        }
    }

    pub fn executable(exec_id: &str, md5: &str, destination: PathBuf) -> Self {
        Self {
            kind: FetchKind::Executable {
                exec_id: exec_id.to_string(),
            },
            destination,
            checksum: Checksum::Md5(md5.to_string()),
            use_cache: true,
        }
    }

    pub fn testcase(testcase_id: i64, part: TestcasePart, md5: &str, destination: PathBuf) -> Self {
        Self {
            kind: FetchKind::Testcase { testcase_id, part },
            destination,
            checksum: Checksum::Md5(md5.to_string()),
            use_cache: true,
        }
    }

    /// Name of the cache entry, `None` when this request cannot be cached.
    fn cache_name(&self) -> Option<String> {
        if !self.use_cache {
            return None;
        }
        match (&self.kind, self.checksum.expected()) {
            (FetchKind::Executable { exec_id }, Some(_)) => Some(exec_id.clone()),
            (FetchKind::Testcase { testcase_id, part }, Some(md5)) => {
                Some(format!("{}-{}.{}", testcase_id, md5, part.extension()))
            }
            _ => None,
        }
    }
}

/// Where the pipeline gets its files from.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the path actually written, which differs from the requested
    /// destination for submission code.
    async fn fetch(&self, request: FetchRequest) -> Result<PathBuf>;
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn verify(checksum: &Checksum, data: &[u8]) -> Result<(), DownloadError> {
    match checksum {
        Checksum::Skip => Ok(()),
        Checksum::Md5(expected) => {
            let actual = md5_hex(data);
            if actual.eq_ignore_ascii_case(expected.trim()) {
                Ok(())
            } else {
                Err(DownloadError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn link_into_place(source: &Path, destination: &Path) -> std::io::Result<()> {
    remove_if_exists(destination)?;
    fs::hard_link(source, destination)
}

pub struct Downloader {
    endpoint: HttpEndpoint,
    cache_root: PathBuf,
}

impl Downloader {
    pub fn new(endpoint: HttpEndpoint, cache_root: PathBuf) -> Self {
        Self { endpoint, cache_root }
    }

    /// Drop every cached blob and recreate an empty cache root.
    pub fn clean_cache(&self) -> Result<()> {
        match fs::remove_dir_all(&self.cache_root) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                return Err(e).context("error clean up cache");
            }
            _ => {}
        }
        fs::create_dir_all(&self.cache_root).context("error clean up cache")?;
        info!(cache_root = %self.cache_root.display(), "Cache cleaned");
        Ok(())
    }

    fn lookup_cache(&self, name: &str, checksum: &Checksum) -> Result<PathBuf> {
        let entry = self.cache_root.join(name);
        let meta = fs::metadata(&entry).context("error lookup cache")?;
        if !meta.is_dir() {
            anyhow::bail!("error lookup cache: {} is not a dir", entry.display());
        }
        let content = entry.join(CACHE_CONTENT);
        let data = fs::read(&content).context("error lookup cache")?;
        verify(checksum, &data).context("error lookup cache")?;
        Ok(content)
    }

    fn save_cache(&self, name: &str, checksum: &Checksum, source: &Path) -> Result<()> {
        let entry = self.cache_root.join(name);
        fs::create_dir_all(&entry).context("save into cache failed")?;
        link_into_place(source, &entry.join(CACHE_CONTENT)).context("save into cache failed")?;
        if let Some(md5) = checksum.expected() {
            fs::write(entry.join(CACHE_CHECKSUM), md5).context("save into cache failed")?;
        }
        Ok(())
    }

    /// Decoded bytes plus, for code, the server-assigned file name.
    async fn download(&self, kind: &FetchKind) -> Result<(Vec<u8>, Option<String>)> {
        let (content, filename) = match kind {
            FetchKind::Code { submit_id } => {
                let files: Vec<SubmissionFile> = self
                    .endpoint
                    .get_json(&api::submission_files(*submit_id))
                    .await?;
                let first = files.into_iter().next().ok_or(DownloadError::EmptySubmission)?;
                (first.content, Some(first.filename))
            }
            FetchKind::Executable { exec_id } => {
                let content: String = self.endpoint.get_json(&api::executable(exec_id)).await?;
                (content, None)
            }
            FetchKind::Testcase { testcase_id, part } => {
                let content: String = self
                    .endpoint
                    .get_json(&api::testcase_file(*testcase_id, *part))
                    .await?;
                (content, None)
            }
        };
        let data = general_purpose::STANDARD
            .decode(content.trim())
            .map_err(DownloadError::from)?;
        Ok((data, filename))
    }
}

/// Only the final path component of a server-provided name is used.
fn sanitize_filename(name: &str) -> Result<&str, DownloadError> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| DownloadError::BadFilename(name.to_string()))
}

#[async_trait]
impl Fetcher for Downloader {
    async fn fetch(&self, request: FetchRequest) -> Result<PathBuf> {
        let cache_name = request.cache_name();

        if let Some(name) = &cache_name {
            match self.lookup_cache(name, &request.checksum) {
                Ok(cached) => match link_into_place(&cached, &request.destination) {
                    Ok(()) => {
                        debug!(name = %name, "Cache hit");
                        return Ok(request.destination);
                    }
                    Err(e) => warn!(name = %name, error = %e, "Cache link failed, fall back to no cache mode"),
                },
                Err(e) => debug!(name = %name, error = %format!("{:#}", e), "Cache miss, fall back to no cache mode"),
            }
        }

        let (data, filename) = self
            .download(&request.kind)
            .await
            .with_context(|| format!("error processing download {:?}", request.kind))?;
        verify(&request.checksum, &data)?;

        let destination = match filename {
            Some(name) => request.destination.with_file_name(sanitize_filename(&name)?),
            None => request.destination,
        };
        remove_if_exists(&destination).context("error processing download")?;
        fs::write(&destination, &data)
            .with_context(|| format!("error writing {}", destination.display()))?;

        if let Some(name) = &cache_name {
            if let Err(e) = self.save_cache(name, &request.checksum, &destination) {
                warn!(name = %name, error = %format!("{:#}", e), "Cache save failed");
            }
        }
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, RawQuery, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ZIP: &[u8] = b"PK\x03\x04 pretend zip";

    #[derive(Default)]
    struct Hits(AtomicUsize);

    async fn executable(State(hits): State<Arc<Hits>>) -> Json<String> {
        hits.0.fetch_add(1, Ordering::SeqCst);
        Json(general_purpose::STANDARD.encode(ZIP))
    }

    async fn submission(Query(params): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
        if params.get("id").map(String::as_str) == Some("0") {
            return Json(json!([]));
        }
        Json(json!([{
            "filename": "main.cpp",
            "content": general_purpose::STANDARD.encode("int main() {}"),
        }]))
    }

    async fn testcase(RawQuery(query): RawQuery) -> Json<String> {
        let body = if query.unwrap_or_default().ends_with("input") { "1 2\n" } else { "3\n" };
        Json(general_purpose::STANDARD.encode(body))
    }

    async fn downloader(cache_root: PathBuf) -> (Downloader, Arc<Hits>) {
        let hits = Arc::new(Hits::default());
        let app = Router::new()
            .route("/executable", get(executable))
            .route("/submission_files", get(submission))
            .route("/testcase_files", get(testcase))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let endpoint = HttpEndpoint::with_credentials(&format!("http://{}", addr), "judge-01", "", "").unwrap();
        (Downloader::new(endpoint, cache_root), hits)
    }

    #[tokio::test]
    async fn test_executable_cached_after_first_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (dl, hits) = downloader(dir.path().join("cache")).await;
        dl.clean_cache().unwrap();
        let md5 = md5_hex(ZIP);

        let first = dir.path().join("a.zip");
        dl.fetch(FetchRequest::executable("cpp", &md5, first.clone())).await.unwrap();
        assert_eq!(fs::read(&first).unwrap(), ZIP);
        assert!(dir.path().join("cache/cpp/content").exists());
        assert_eq!(fs::read_to_string(dir.path().join("cache/cpp/checksum")).unwrap(), md5);

        let second = dir.path().join("b.zip");
        dl.fetch(FetchRequest::executable("cpp", &md5, second.clone())).await.unwrap();
        assert_eq!(fs::read(&second).unwrap(), ZIP);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1, "second fetch must come from cache");
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let (dl, hits) = downloader(cache.clone()).await;
        fs::create_dir_all(cache.join("cpp")).unwrap();
        fs::write(cache.join("cpp/content"), b"stale").unwrap();

        let dest = dir.path().join("a.zip");
        dl.fetch(FetchRequest::executable("cpp", &md5_hex(ZIP), dest.clone()))
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), ZIP);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(cache.join("cpp/content")).unwrap(), ZIP);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (dl, _) = downloader(dir.path().join("cache")).await;
        let dest = dir.path().join("a.zip");

        let err = dl
            .fetch(FetchRequest::executable("cpp", "00000000000000000000000000000000", dest.clone()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::ChecksumMismatch { .. })
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_code_uses_server_filename() {
        let dir = tempfile::tempdir().unwrap();
        let (dl, _) = downloader(dir.path().join("cache")).await;

        let path = dl.fetch(FetchRequest::code(12, dir.path())).await.unwrap();
        assert_eq!(path, dir.path().join("main.cpp"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "int main() {}");

        let err = dl.fetch(FetchRequest::code(0, dir.path())).await.unwrap_err();
        assert!(format!("{:#}", err).contains("submission has no files"));
    }

    #[tokio::test]
    async fn test_testcase_parts() {
        let dir = tempfile::tempdir().unwrap();
        let (dl, _) = downloader(dir.path().join("cache")).await;

        let input = dir.path().join("testcase001.in");
        let output = dir.path().join("testcase001.out");
        dl.fetch(FetchRequest::testcase(5, TestcasePart::Input, &md5_hex(b"1 2\n"), input.clone()))
            .await
            .unwrap();
        dl.fetch(FetchRequest::testcase(5, TestcasePart::Output, &md5_hex(b"3\n"), output.clone()))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(input).unwrap(), "1 2\n");
        assert_eq!(fs::read_to_string(output).unwrap(), "3\n");
        assert!(dir
            .path()
            .join(format!("cache/5-{}.out", md5_hex(b"3\n")))
            .is_dir());
    }

    #[test]
    fn test_cache_names() {
        let exe = FetchRequest::executable("run", "abc", PathBuf::from("x"));
        assert_eq!(exe.cache_name().as_deref(), Some("run"));
        let tc = FetchRequest::testcase(7, TestcasePart::Input, "abc", PathBuf::from("x"));
        assert_eq!(tc.cache_name().as_deref(), Some("7-abc.in"));
        assert_eq!(FetchRequest::code(1, Path::new("/w")).cache_name(), None);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("main.cpp").unwrap(), "main.cpp");
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("").is_err());
    }
}
