//! Model hub publishing.
//!
//! Uploads a saved model directory to a hub repository in a single commit.
//! Small files travel inline in the commit payload; large files are sent to
//! LFS storage first and referenced by their sha256 oid.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use reqwest::blocking::{Body, Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{HeartGptError, Result};

/// Default hub endpoint, overridable with `HF_ENDPOINT`.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Files above this size are uploaded through LFS.
pub const LFS_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// A hub access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

impl Credentials {
    /// Wrap an explicit token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    /// Find a token: the config value, then `HF_TOKEN`, then the token files
    /// written by the hub CLI.
    #[must_use]
    pub fn resolve(config_token: Option<&str>) -> Option<Self> {
        Self::from_sources(
            config_token,
            std::env::var("HF_TOKEN").ok(),
            dirs::home_dir(),
        )
    }

    /// Like [`Credentials::resolve`], but a missing token is an error.
    ///
    /// # Errors
    ///
    /// Returns [`HeartGptError::Auth`] if no source yields a token.
    pub fn require(config_token: Option<&str>) -> Result<Self> {
        Self::resolve(config_token).ok_or_else(|| {
            HeartGptError::Auth(
                "no hub token: set hub.token, HF_TOKEN, or run `huggingface-cli login`".into(),
            )
        })
    }

    fn from_sources(
        config_token: Option<&str>,
        env_token: Option<String>,
        home: Option<PathBuf>,
    ) -> Option<Self> {
        let non_empty = |t: &str| {
            let t = t.trim();
            (!t.is_empty()).then(|| Self::new(t))
        };

        if let Some(creds) = config_token.and_then(non_empty) {
            return Some(creds);
        }
        if let Some(creds) = env_token.as_deref().and_then(non_empty) {
            return Some(creds);
        }
        let home = home?;
        [
            home.join(".cache").join("huggingface").join("token"),
            home.join(".huggingface").join("token"),
        ]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok().as_deref().and_then(non_empty))
    }

    /// The raw token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Fully qualified repository id.
    pub repo_id: String,
    /// Browser URL of the repository.
    pub repo_url: String,
    /// Number of files in the commit.
    pub files_uploaded: usize,
}

/// A file staged for the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Location on disk.
    pub local_path: PathBuf,
    /// Path inside the repository, `/`-separated.
    pub path_in_repo: String,
    /// Size in bytes.
    pub size: u64,
}

impl StagedFile {
    /// Whether the file goes through LFS.
    #[must_use]
    pub fn is_lfs(&self) -> bool {
        self.size > LFS_THRESHOLD_BYTES
    }
}

/// Every regular file under `dir`, sorted by repository path.
///
/// # Errors
///
/// Returns an error if `dir` is not a directory or cannot be read.
pub fn stage_directory(dir: &Path) -> Result<Vec<StagedFile>> {
    if !dir.is_dir() {
        return Err(HeartGptError::Hub(format!("{} is not a directory", dir.display())));
    }
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(dir)
                .map_err(|e| HeartGptError::Hub(e.to_string()))?;
            let path_in_repo = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(StagedFile {
                local_path: path,
                path_in_repo,
                size: meta.len(),
            });
        }
    }
    files.sort_by(|a, b| a.path_in_repo.cmp(&b.path_in_repo));
    Ok(files)
}

/// Hex sha256 of a file, streamed.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Deserialize)]
struct WhoAmI {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LfsBatchResponse {
    objects: Vec<LfsObject>,
}

#[derive(Debug, Deserialize)]
struct LfsObject {
    oid: String,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<LfsObjectError>,
}

#[derive(Debug, Deserialize)]
struct LfsObjectError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LfsActions {
    upload: Option<LfsAction>,
    verify: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: serde_json::Map<String, serde_json::Value>,
}

/// Hub client that creates repositories and commits files.
pub struct HfPublisher {
    client: Client,
    endpoint: String,
    credentials: Credentials,
}

impl fmt::Debug for HfPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfPublisher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HfPublisher {
    /// Create a publisher against `HF_ENDPOINT` or the public hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(credentials: Credentials) -> Result<Self> {
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        Self::with_endpoint(credentials, endpoint)
    }

    /// Create a publisher against a specific endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_endpoint(credentials: Credentials, endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("heartgpt-rs/", env!("CARGO_PKG_VERSION")))
            .timeout(None::<std::time::Duration>)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Name of the account that owns the token.
    ///
    /// # Errors
    ///
    /// Returns [`HeartGptError::Auth`] if the token is rejected.
    pub fn whoami(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/api/whoami-v2", self.endpoint))
            .bearer_auth(self.credentials.token())
            .send()?;
        if response.status().as_u16() == 401 {
            return Err(HeartGptError::Auth("hub rejected the token".into()));
        }
        let who: WhoAmI = check(response, "whoami")?.json()?;
        Ok(who.name)
    }

    /// Qualify a bare repository name with the token owner's namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace lookup fails.
    pub fn resolve_repo_id(&self, repo_id: &str) -> Result<String> {
        if repo_id.trim().is_empty() {
            return Err(HeartGptError::Hub("repo id is empty".into()));
        }
        if repo_id.contains('/') {
            return Ok(repo_id.to_string());
        }
        let user = self.whoami()?;
        Ok(format!("{user}/{repo_id}"))
    }

    /// Create a model repository. An existing repository is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error on any other failure status.
    pub fn create_repo(&self, repo_id: &str, private: bool) -> Result<String> {
        let (organization, name) = match repo_id.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, repo_id),
        };
        let mut body = json!({
            "name": name,
            "type": "model",
            "private": private,
        });
        if let Some(org) = organization {
            body["organization"] = json!(org);
        }

        let response = self
            .client
            .post(format!("{}/api/repos/create", self.endpoint))
            .bearer_auth(self.credentials.token())
            .json(&body)
            .send()?;
        if response.status().as_u16() == 409 {
            tracing::info!("Repository {repo_id} already exists");
        } else {
            check(response, "create repo")?;
            tracing::info!("Created repository {repo_id}");
        }
        Ok(format!("{}/{repo_id}", self.endpoint))
    }

    /// Upload every file in `dir` to `repo_id` as one commit on `main`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is empty or any request fails.
    pub fn push(
        &self,
        dir: &Path,
        repo_id: &str,
        private: bool,
        commit_message: &str,
    ) -> Result<PublishReport> {
        let files = stage_directory(dir)?;
        if files.is_empty() {
            return Err(HeartGptError::Hub(format!("nothing to upload in {}", dir.display())));
        }

        let repo_id = self.resolve_repo_id(repo_id)?;
        let repo_url = self.create_repo(&repo_id, private)?;

        let mut lines = vec![json!({
            "key": "header",
            "value": { "summary": commit_message, "description": "" },
        })];
        for file in &files {
            if file.is_lfs() {
                let oid = sha256_file(&file.local_path)?;
                self.upload_lfs(&repo_id, file, &oid)?;
                lines.push(json!({
                    "key": "lfsFile",
                    "value": {
                        "path": file.path_in_repo,
                        "algo": "sha256",
                        "oid": oid,
                        "size": file.size,
                    },
                }));
            } else {
                let content = std::fs::read(&file.local_path)?;
                lines.push(json!({
                    "key": "file",
                    "value": {
                        "path": file.path_in_repo,
                        "content": base64::engine::general_purpose::STANDARD.encode(content),
                        "encoding": "base64",
                    },
                }));
            }
        }

        let mut payload = String::new();
        for line in &lines {
            payload.push_str(&serde_json::to_string(line)?);
            payload.push('\n');
        }
        let response = self
            .client
            .post(format!("{}/api/models/{repo_id}/commit/main", self.endpoint))
            .bearer_auth(self.credentials.token())
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()?;
        check(response, "commit")?;

        tracing::info!("Pushed {} files to {}", files.len(), repo_url);
        Ok(PublishReport {
            repo_id,
            repo_url,
            files_uploaded: files.len(),
        })
    }

    fn upload_lfs(&self, repo_id: &str, file: &StagedFile, oid: &str) -> Result<()> {
        let request = json!({
            "operation": "upload",
            "transfers": ["basic", "multipart"],
            "objects": [{ "oid": oid, "size": file.size }],
            "hash_algo": "sha256",
        });
        let response = self
            .client
            .post(format!("{}/{repo_id}.git/info/lfs/objects/batch", self.endpoint))
            .bearer_auth(self.credentials.token())
            .header("Accept", "application/vnd.git-lfs+json")
            .header("Content-Type", "application/vnd.git-lfs+json")
            .json(&request)
            .send()?;
        let batch: LfsBatchResponse = check(response, "lfs batch")?.json()?;

        let object = batch
            .objects
            .into_iter()
            .find(|o| o.oid == oid)
            .ok_or_else(|| HeartGptError::Hub(format!("lfs batch did not answer for {}", file.path_in_repo)))?;
        if let Some(err) = object.error {
            return Err(HeartGptError::Hub(format!(
                "lfs rejected {} ({}): {}",
                file.path_in_repo, err.code, err.message
            )));
        }
        let Some(actions) = object.actions else {
            tracing::debug!("{} already in LFS storage", file.path_in_repo);
            return Ok(());
        };

        if let Some(upload) = actions.upload {
            tracing::info!("Uploading {} ({} bytes) to LFS", file.path_in_repo, file.size);
            match upload.header.get("chunk_size").and_then(header_usize) {
                Some(chunk_size) => self.upload_multipart(file, oid, &upload, chunk_size)?,
                None => {
                    let body = Body::sized(File::open(&file.local_path)?, file.size);
                    let response = self.client.put(&upload.href).body(body).send()?;
                    check(response, "lfs upload")?;
                }
            }
        }
        if let Some(verify) = actions.verify {
            let response = self
                .client
                .post(&verify.href)
                .bearer_auth(self.credentials.token())
                .json(&json!({ "oid": oid, "size": file.size }))
                .send()?;
            check(response, "lfs verify")?;
        }
        Ok(())
    }

    fn upload_multipart(
        &self,
        file: &StagedFile,
        oid: &str,
        upload: &LfsAction,
        chunk_size: usize,
    ) -> Result<()> {
        let mut part_urls: Vec<(usize, &str)> = upload
            .header
            .iter()
            .filter_map(|(k, v)| Some((k.parse::<usize>().ok()?, v.as_str()?)))
            .collect();
        part_urls.sort_by_key(|(n, _)| *n);

        let mut source = File::open(&file.local_path)?;
        let mut parts = Vec::with_capacity(part_urls.len());
        for (number, url) in part_urls {
            let offset = number.saturating_sub(1) as u64 * chunk_size as u64;
            source.seek(SeekFrom::Start(offset))?;
            let mut chunk = Vec::with_capacity(chunk_size);
            (&mut source).take(chunk_size as u64).read_to_end(&mut chunk)?;
            let response = check(self.client.put(url).body(chunk).send()?, "lfs part")?;
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| HeartGptError::Hub(format!("part {number} returned no etag")))?
                .to_string();
            parts.push(json!({ "partNumber": number, "etag": etag }));
        }

        let response = self
            .client
            .post(&upload.href)
            .header("Accept", "application/vnd.git-lfs+json")
            .json(&json!({ "oid": oid, "parts": parts }))
            .send()?;
        check(response, "lfs multipart completion")?;
        Ok(())
    }
}

fn header_usize(value: &serde_json::Value) -> Option<usize> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        _ => None,
    }
}

fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(HeartGptError::Hub(format!("{what} failed: HTTP {status}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_token_wins() {
        let creds = Credentials::from_sources(Some("hf_config"), Some("hf_env".into()), None);
        assert_eq!(creds.map(|c| c.token().to_string()), Some("hf_config".into()));
    }

    #[test]
    fn test_env_token_before_files() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".huggingface")).unwrap();
        std::fs::write(home.path().join(".huggingface/token"), "hf_file").unwrap();

        let creds = Credentials::from_sources(None, Some("hf_env".into()), Some(home.path().into()));
        assert_eq!(creds.unwrap().token(), "hf_env");
    }

    #[test]
    fn test_cache_token_file_before_legacy_file() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".cache/huggingface")).unwrap();
        std::fs::create_dir_all(home.path().join(".huggingface")).unwrap();
        std::fs::write(home.path().join(".cache/huggingface/token"), "hf_cache\n").unwrap();
        std::fs::write(home.path().join(".huggingface/token"), "hf_legacy").unwrap();

        let creds = Credentials::from_sources(None, None, Some(home.path().into()));
        assert_eq!(creds.unwrap().token(), "hf_cache");
    }

    #[test]
    fn test_blank_tokens_are_skipped() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".huggingface")).unwrap();
        std::fs::write(home.path().join(".huggingface/token"), "hf_legacy").unwrap();

        let creds = Credentials::from_sources(Some("  "), Some(String::new()), Some(home.path().into()));
        assert_eq!(creds.unwrap().token(), "hf_legacy");
        assert!(Credentials::from_sources(None, None, None).is_none());
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::new("hf_secret");
        assert!(!format!("{creds:?}").contains("hf_secret"));
    }

    #[test]
    fn test_stage_directory_sorted_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("a.bin"), [0u8; 3]).unwrap();

        let files = stage_directory(dir.path()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path_in_repo.as_str()).collect();
        assert_eq!(paths, vec!["a.bin", "config.json", "sub/notes.txt"]);
        assert_eq!(files[0].size, 3);
        assert!(!files[0].is_lfs());
    }

    #[test]
    fn test_stage_directory_rejects_missing_dir() {
        let err = stage_directory(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, HeartGptError::Hub(_)));
    }

    #[test]
    fn test_lfs_threshold() {
        let file = StagedFile {
            local_path: PathBuf::from("model.safetensors"),
            path_in_repo: "model.safetensors".into(),
            size: LFS_THRESHOLD_BYTES + 1,
        };
        assert!(file.is_lfs());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_header_usize() {
        assert_eq!(header_usize(&json!("5242880")), Some(5_242_880));
        assert_eq!(header_usize(&json!(16)), Some(16));
        assert_eq!(header_usize(&json!(null)), None);
    }

    #[test]
    fn test_resolve_repo_id_keeps_qualified_names() {
        let publisher = HfPublisher::with_endpoint(Credentials::new("t"), "http://127.0.0.1:9/").unwrap();
        assert_eq!(publisher.resolve_repo_id("org/model").unwrap(), "org/model");
        assert!(publisher.resolve_repo_id("").is_err());
    }
}
