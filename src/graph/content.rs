//! Win32 app content upload
//!
//! See: https://learn.microsoft.com/en-us/mem/intune/developer/intune-graph-apis
//!
//! 1. Create a content version for the app
//! 2. Create a content file record (plain and encrypted sizes)
//! 3. Wait for Intune to hand out an Azure Storage SAS URI
//! 4. PUT the encrypted payload as blocks, renewing the SAS URI when it ages out
//! 5. PUT the block list
//! 6. Commit the file with the encryption info from `Detection.xml`
//! 7. Wait for `commitFileSuccess`
//! 8. Point the app at the committed content version
//!
//! Progress is checkpointed next to the package after every block, so an
//! interrupted upload picks up where it stopped.

use super::apps::{MOBILE_APPS, WIN32_APP_TYPE};
use super::{GraphClient, RetryPolicy};
use crate::config::PackagingSettings;
use crate::error::{IntunePackError, Result};
use crate::packaging::IntuneWinPackage;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STORAGE_URI_SUCCESS: &str = "azureStorageUriRequestSuccess";
const STORAGE_URI_FAILED: &str = "azureStorageUriRequestFailed";
const RENEWAL_SUCCESS: &str = "azureStorageUriRenewalSuccess";
const RENEWAL_FAILED: &str = "azureStorageUriRenewalFailed";
const COMMIT_SUCCESS: &str = "commitFileSuccess";
const COMMIT_FAILED: &str = "commitFileFailed";

/// How often and how long to poll a content file's `uploadState`
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub max_chunk_retries: u32,
    /// Backoff between attempts of a single block
    pub block_backoff: RetryPolicy,
    pub storage_poll: PollPolicy,
    pub commit_poll: PollPolicy,
    /// SAS URIs are valid for about ten minutes; renew before that
    pub sas_renewal_interval: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 6 * 1024 * 1024,
            max_chunk_retries: 5,
            block_backoff: RetryPolicy::default(),
            storage_poll: PollPolicy::new(Duration::from_secs(2), 30),
            commit_poll: PollPolicy::new(Duration::from_secs(2), 60),
            sas_renewal_interval: Duration::from_secs(7 * 60),
        }
    }
}

impl UploadOptions {
    pub fn from_settings(settings: &PackagingSettings) -> Result<Self> {
        Ok(Self {
            chunk_size: settings.chunk_size_bytes()?,
            max_chunk_retries: settings.max_chunk_retries.max(1),
            ..Self::default()
        })
    }
}

/// Upload state persisted next to the package (`<file>.upload.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub app_id: String,
    pub content_version_id: String,
    pub file_id: String,
    pub blocks_done: u32,
    pub chunk_size: usize,
    pub payload_digest: String,
    /// Intune reported `commitFileSuccess`; only the app pointer is left
    #[serde(default)]
    pub committed: bool,
    pub updated_at: DateTime<Utc>,
}

impl UploadCheckpoint {
    pub fn path_for(package: &Path) -> PathBuf {
        let mut name = package
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".upload.json");
        package.with_file_name(name)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Checkpoint for this package, if one exists and still describes it
    pub fn for_package(package: &IntuneWinPackage) -> Result<Option<Self>> {
        let path = Self::path_for(&package.path);
        Ok(Self::load(&path)?
            .filter(|c| c.payload_digest == payload_digest(package)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn remove(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Identifies one encryption of the content; the MAC changes with every key
pub fn payload_digest(package: &IntuneWinPackage) -> String {
    package.info.encryption_info.mac.clone()
}

/// Fixed-width block id, base64 of `block-00000042`
pub fn block_id(index: u32) -> String {
    BASE64.encode(format!("block-{:08}", index))
}

pub fn block_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

fn with_query(sas_uri: &str, query: &str) -> String {
    let separator = if sas_uri.contains('?') { '&' } else { '?' };
    format!("{}{}{}", sas_uri, separator, query)
}

pub fn block_list_xml(count: u32) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for index in 0..count {
        xml.push_str("<Latest>");
        xml.push_str(&block_id(index));
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub upload_state: String,
    #[serde(default)]
    pub azure_storage_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub content_version_id: String,
    pub file_id: String,
    pub blocks: u32,
    /// Blocks skipped because an earlier run already uploaded them
    pub resumed_blocks: u32,
}

enum BlobFailure {
    /// 403 from storage: the SAS URI expired or was revoked
    Forbidden,
    Other(String),
}

/// Azure Blob block uploads; the SAS URI carries the authorization
struct BlobUploader {
    client: reqwest::Client,
}

impl BlobUploader {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<(), BlobFailure> {
        match request.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) if resp.status() == StatusCode::FORBIDDEN => Err(BlobFailure::Forbidden),
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Err(BlobFailure::Other(format!("HTTP {}: {}", status, body.trim())))
            }
            Err(e) => Err(BlobFailure::Other(e.to_string())),
        }
    }

    async fn put_block(
        &self,
        sas_uri: &str,
        index: u32,
        data: Vec<u8>,
    ) -> std::result::Result<(), BlobFailure> {
        let url = with_query(
            sas_uri,
            &format!("comp=block&blockid={}", urlencoding::encode(&block_id(index))),
        );
        self.send(
            self.client
                .put(url)
                .header("x-ms-blob-type", "BlockBlob")
                .body(data),
        )
        .await
    }

    async fn put_block_list(&self, sas_uri: &str, count: u32) -> std::result::Result<(), BlobFailure> {
        self.send(
            self.client
                .put(with_query(sas_uri, "comp=blocklist"))
                .header("Content-Type", "application/xml")
                .body(block_list_xml(count)),
        )
        .await
    }
}

/// A granted SAS URI and when it was obtained
struct StorageGrant {
    uri: String,
    obtained: Instant,
}

pub struct ContentUploader<'a> {
    graph: &'a GraphClient,
    blob: BlobUploader,
    options: UploadOptions,
    progress: ProgressBar,
}

impl<'a> ContentUploader<'a> {
    pub fn new(graph: &'a GraphClient, options: UploadOptions) -> Self {
        Self {
            graph,
            blob: BlobUploader::new(),
            options,
            progress: ProgressBar::hidden(),
        }
    }

    /// Report uploaded bytes on `bar`; its length is set to the encrypted size
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = bar;
        self
    }

    fn versions_endpoint(app_id: &str) -> String {
        format!("{}/{}/microsoft.graph.win32LobApp/contentVersions", MOBILE_APPS, app_id)
    }

    fn file_endpoint(app_id: &str, version_id: &str, file_id: &str) -> String {
        format!(
            "{}/{}/files/{}",
            Self::versions_endpoint(app_id),
            version_id,
            file_id
        )
    }

    /// Poll the content file until `uploadState` is one of `success`
    async fn wait_for_state(
        &self,
        endpoint: &str,
        success: &[&str],
        failure: &[&str],
        policy: PollPolicy,
    ) -> Result<ContentFile> {
        for attempt in 0..policy.max_attempts.max(1) {
            let file: ContentFile = self.graph.get(endpoint).await?;
            tracing::debug!("uploadState = {} (poll {})", file.upload_state, attempt + 1);

            if success.contains(&file.upload_state.as_str()) {
                return Ok(file);
            }
            if failure.contains(&file.upload_state.as_str()) {
                return Err(IntunePackError::UploadError(format!(
                    "Intune reported {}",
                    file.upload_state
                )));
            }
            tokio::time::sleep(policy.interval).await;
        }

        Err(IntunePackError::UploadError(format!(
            "Timed out waiting for {}",
            success.join(" or ")
        )))
    }

    async fn storage_grant(&self, endpoint: &str, success: &[&str], failure: &[&str]) -> Result<StorageGrant> {
        let file = self
            .wait_for_state(endpoint, success, failure, self.options.storage_poll)
            .await?;
        let uri = file.azure_storage_uri.filter(|u| !u.is_empty()).ok_or_else(|| {
            IntunePackError::UploadError(format!("{} without azureStorageUri", file.upload_state))
        })?;
        Ok(StorageGrant {
            uri,
            obtained: Instant::now(),
        })
    }

    async fn renew(&self, endpoint: &str) -> Result<StorageGrant> {
        tracing::info!("Renewing Azure Storage SAS URI");
        self.graph
            .post_empty(&format!("{}/renewUpload", endpoint), &json!({}))
            .await?;
        self.storage_grant(endpoint, &[RENEWAL_SUCCESS], &[RENEWAL_FAILED])
            .await
    }

    /// Upload `package` as the content of `app_id` and commit it
    pub async fn upload(&self, app_id: &str, package: &IntuneWinPackage) -> Result<UploadOutcome> {
        let checkpoint_path = UploadCheckpoint::path_for(&package.path);
        let digest = payload_digest(package);
        let encrypted_size = package.encrypted_size()?;
        let chunk_size = self.options.chunk_size.max(1);
        let total_blocks = block_count(encrypted_size, chunk_size);

        let resume = UploadCheckpoint::load(&checkpoint_path)?.filter(|c| {
            let usable =
                c.app_id == app_id && c.payload_digest == digest && c.chunk_size == chunk_size;
            if !usable {
                tracing::warn!("Checkpoint {} does not match this upload", checkpoint_path.display());
            }
            usable
        });

        let mut checkpoint = match resume {
            Some(checkpoint) => {
                tracing::info!(
                    "Resuming upload at block {}/{}",
                    checkpoint.blocks_done,
                    total_blocks
                );
                checkpoint
            }
            None => {
                let version: Value = self
                    .graph
                    .post(&Self::versions_endpoint(app_id), &json!({}))
                    .await?;
                let content_version_id = version["id"]
                    .as_str()
                    .ok_or_else(|| IntunePackError::GraphApiError("No content version ID".into()))?
                    .to_string();
                tracing::debug!("Content version {}", content_version_id);

                let file_name = package
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| package.info.file_name.clone());
                let file: ContentFile = self
                    .graph
                    .post(
                        &format!(
                            "{}/{}/files",
                            Self::versions_endpoint(app_id),
                            content_version_id
                        ),
                        &json!({
                            "@odata.type": "#microsoft.graph.mobileAppContentFile",
                            "name": file_name,
                            "size": package.info.unencrypted_content_size,
                            "sizeEncrypted": encrypted_size,
                            "manifest": null,
                            "isDependency": false,
                        }),
                    )
                    .await?;
                if file.id.is_empty() {
                    return Err(IntunePackError::GraphApiError("No content file ID".into()));
                }
                tracing::debug!("Content file {}", file.id);

                UploadCheckpoint {
                    app_id: app_id.to_string(),
                    content_version_id,
                    file_id: file.id,
                    blocks_done: 0,
                    chunk_size,
                    payload_digest: digest,
                    committed: false,
                    updated_at: Utc::now(),
                }
            }
        };
        checkpoint.save(&checkpoint_path)?;
        let resumed_blocks = if checkpoint.committed {
            total_blocks
        } else {
            checkpoint.blocks_done.min(total_blocks)
        };

        let file_endpoint = Self::file_endpoint(
            app_id,
            &checkpoint.content_version_id,
            &checkpoint.file_id,
        );

        if checkpoint.committed {
            tracing::info!(
                "Content file {} already committed, updating the app only",
                checkpoint.file_id
            );
        } else {
            self.upload_blocks(
                package,
                &file_endpoint,
                &mut checkpoint,
                &checkpoint_path,
                total_blocks,
            )
            .await?;

            self.graph
                .post_empty(
                    &format!("{}/commit", file_endpoint),
                    &json!({ "fileEncryptionInfo": package.info.encryption_info }),
                )
                .await?;
            self.wait_for_state(
                &file_endpoint,
                &[COMMIT_SUCCESS],
                &[COMMIT_FAILED],
                self.options.commit_poll,
            )
            .await?;
            tracing::info!("Content file {} committed", checkpoint.file_id);

            checkpoint.committed = true;
            checkpoint.updated_at = Utc::now();
            checkpoint.save(&checkpoint_path)?;
        }

        self.graph
            .patch(
                &format!("{}/{}", MOBILE_APPS, app_id),
                &json!({
                    "@odata.type": WIN32_APP_TYPE,
                    "committedContentVersion": checkpoint.content_version_id,
                }),
            )
            .await?;

        UploadCheckpoint::remove(&checkpoint_path)?;

        Ok(UploadOutcome {
            content_version_id: checkpoint.content_version_id,
            file_id: checkpoint.file_id,
            blocks: total_blocks,
            resumed_blocks,
        })
    }

    /// PUT the blocks after `checkpoint.blocks_done`, then the block list
    async fn upload_blocks(
        &self,
        package: &IntuneWinPackage,
        file_endpoint: &str,
        checkpoint: &mut UploadCheckpoint,
        checkpoint_path: &Path,
        total_blocks: u32,
    ) -> Result<()> {
        let chunk_size = checkpoint.chunk_size;
        let resumed_blocks = checkpoint.blocks_done.min(total_blocks);

        let mut grant = if resumed_blocks > 0 {
            // the SAS from the interrupted run has likely expired
            self.renew(file_endpoint).await?
        } else {
            self.storage_grant(
                file_endpoint,
                &[STORAGE_URI_SUCCESS, RENEWAL_SUCCESS],
                &[STORAGE_URI_FAILED, RENEWAL_FAILED],
            )
            .await?
        };

        let mut payload = tempfile::tempfile()?;
        let encrypted_size = package.extract_payload(&mut payload)?;

        self.progress.set_length(encrypted_size);
        self.progress
            .set_position((resumed_blocks as u64 * chunk_size as u64).min(encrypted_size));

        for index in resumed_blocks..total_blocks {
            let offset = index as u64 * chunk_size as u64;
            let len = (encrypted_size - offset).min(chunk_size as u64) as usize;
            let mut data = vec![0u8; len];
            payload.seek(SeekFrom::Start(offset))?;
            payload.read_exact(&mut data)?;

            self.put_block_with_retry(file_endpoint, &mut grant, index, data)
                .await?;

            checkpoint.blocks_done = index + 1;
            checkpoint.updated_at = Utc::now();
            checkpoint.save(checkpoint_path)?;
            self.progress.inc(len as u64);
        }
        self.progress.finish_and_clear();

        self.put_block_list_with_retry(file_endpoint, &mut grant, total_blocks)
            .await?;
        tracing::info!("Uploaded {} blocks", total_blocks);
        Ok(())
    }

    async fn put_block_with_retry(
        &self,
        file_endpoint: &str,
        grant: &mut StorageGrant,
        index: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let attempts = self.options.max_chunk_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if grant.obtained.elapsed() >= self.options.sas_renewal_interval {
                *grant = self.renew(file_endpoint).await?;
            }

            match self.blob.put_block(&grant.uri, index, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(BlobFailure::Forbidden) => {
                    tracing::warn!("Block {} rejected with 403, renewing SAS URI", index);
                    last_error = "HTTP 403 Forbidden".to_string();
                    *grant = self.renew(file_endpoint).await?;
                }
                Err(BlobFailure::Other(e)) => {
                    let wait_time = self.options.block_backoff.backoff(attempt);
                    tracing::warn!(
                        "Block {} failed: {}. Retrying in {:?}... (attempt {}/{})",
                        index,
                        e,
                        wait_time,
                        attempt + 1,
                        attempts
                    );
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(wait_time).await;
                    }
                }
            }
        }

        Err(IntunePackError::UploadError(format!(
            "Block {} failed after {} attempts: {}",
            index, attempts, last_error
        )))
    }

    async fn put_block_list_with_retry(
        &self,
        file_endpoint: &str,
        grant: &mut StorageGrant,
        count: u32,
    ) -> Result<()> {
        let attempts = self.options.max_chunk_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.blob.put_block_list(&grant.uri, count).await {
                Ok(()) => return Ok(()),
                Err(BlobFailure::Forbidden) => {
                    last_error = "HTTP 403 Forbidden".to_string();
                    *grant = self.renew(file_endpoint).await?;
                }
                Err(BlobFailure::Other(e)) => {
                    tracing::warn!("Block list failed: {} (attempt {}/{})", e, attempt + 1, attempts);
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.options.block_backoff.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(IntunePackError::UploadError(format!(
            "Block list commit failed after {} attempts: {}",
            attempts, last_error
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ids_have_fixed_width() {
        let first = block_id(0);
        let later = block_id(12345);
        assert_eq!(first.len(), later.len());
        assert_eq!(BASE64.decode(&later).unwrap(), b"block-00012345");
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0, 10), 0);
        assert_eq!(block_count(10, 10), 1);
        assert_eq!(block_count(11, 10), 2);
    }

    #[test]
    fn test_block_list_xml() {
        let xml = block_list_xml(2);
        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="utf-8"?><BlockList><Latest>"#));
        assert_eq!(xml.matches("<Latest>").count(), 2);
        assert!(xml.ends_with("</Latest></BlockList>"));
    }

    #[test]
    fn test_with_query() {
        assert_eq!(
            with_query("https://x.blob.core.windows.net/c/f?sv=1&sig=a", "comp=blocklist"),
            "https://x.blob.core.windows.net/c/f?sv=1&sig=a&comp=blocklist"
        );
        assert_eq!(with_query("http://localhost/f", "comp=block"), "http://localhost/f?comp=block");
    }

    #[test]
    fn test_checkpoint_path_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("setup.intunewin");
        let path = UploadCheckpoint::path_for(&package);
        assert_eq!(path, dir.path().join("setup.intunewin.upload.json"));

        assert!(UploadCheckpoint::load(&path).unwrap().is_none());
        let checkpoint = UploadCheckpoint {
            app_id: "app".into(),
            content_version_id: "1".into(),
            file_id: "f".into(),
            blocks_done: 3,
            chunk_size: 1024,
            payload_digest: "mac".into(),
            committed: false,
            updated_at: Utc::now(),
        };
        checkpoint.save(&path).unwrap();
        assert_eq!(UploadCheckpoint::load(&path).unwrap(), Some(checkpoint));

        UploadCheckpoint::remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_checkpoint_without_commit_marker_loads_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.intunewin.upload.json");
        fs::write(
            &path,
            r#"{"app_id":"app","content_version_id":"1","file_id":"f","blocks_done":2,
               "chunk_size":1024,"payload_digest":"mac","updated_at":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap();
        let checkpoint = UploadCheckpoint::load(&path).unwrap().unwrap();
        assert!(!checkpoint.committed);
        assert_eq!(checkpoint.blocks_done, 2);
    }

    #[test]
    fn test_corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.upload.json");
        fs::write(&path, "{not json").unwrap();
        assert!(UploadCheckpoint::load(&path).unwrap().is_none());
    }
}
