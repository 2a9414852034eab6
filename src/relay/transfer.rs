//! Byte transfers against the data endpoint.
//!
//! Payload bytes never travel over the bus. Uploads stream a byte range of a
//! local file into `POST /file/upload`; downloads pull `GET /file/download`
//! into a local file, resuming after whatever is already on disk.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Body, Client, Response};
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

use crate::error::TransferError;
use crate::util::epoch_millis;

/// Downloads are written to disk in chunks of this size.
pub const WRITE_CHUNK: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// One background transfer. Jobs run once; failures are logged by the
/// caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferJob {
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    /// Upload range `[start, end)`. Unused for downloads.
    pub start: u64,
    pub end: u64,
    pub correlation_id: String,
    /// Size of the remote file. Download only.
    pub expected_size: u64,
}

impl FileTransferJob {
    pub fn upload(path: impl Into<PathBuf>, start: u64, end: u64, cid: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local_path: path.into(),
            start,
            end,
            correlation_id: cid.into(),
            expected_size: 0,
        }
    }

    pub fn download(path: impl Into<PathBuf>, expected_size: u64, cid: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Download,
            local_path: path.into(),
            start: 0,
            end: 0,
            correlation_id: cid.into(),
            expected_size,
        }
    }

    /// Run the job to completion. Returns the number of payload bytes moved.
    pub async fn run(&self, endpoint: &DataEndpoint) -> Result<u64, TransferError> {
        match self.direction {
            TransferDirection::Upload => endpoint.upload(self).await,
            TransferDirection::Download => endpoint.download(self).await,
        }
    }
}

/// Where a download resumes: after the bytes already on disk, or from the
/// start if the local copy is already complete (or larger).
pub fn resume_offset(local_len: u64, expected_size: u64) -> u64 {
    if local_len >= expected_size {
        0
    } else {
        local_len
    }
}

/// HTTP client for the data endpoint.
#[derive(Debug, Clone)]
pub struct DataEndpoint {
    base: Url,
    client: Client,
}

impl DataEndpoint {
    pub fn new(base: &str) -> Result<Self, TransferError> {
        Ok(Self {
            base: Url::parse(base)?,
            client: Client::new(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}{path}"));
        url.query_pairs_mut().extend_pairs(query);
        url
    }

    async fn upload(&self, job: &FileTransferJob) -> Result<u64, TransferError> {
        let mut file = File::open(&job.local_path).await?;
        let meta = file.metadata().await?;
        let end = job.end.min(meta.len());
        let start = job.start.min(end);
        let length = end - start;

        let name = file_name(&job.local_path);
        let size = meta.len().to_string();
        let modified = meta.modified().map(epoch_millis).unwrap_or_default().to_string();
        let url = self.url(
            "/file/upload",
            &[
                ("_cid", job.correlation_id.as_str()),
                ("_filename", name.as_str()),
                ("_filesize", size.as_str()),
                ("_file_last_modified", modified.as_str()),
            ],
        );

        file.seek(SeekFrom::Start(start)).await?;
        let body = Body::wrap_stream(ReaderStream::new(file.take(length)));

        debug!(%url, start, end, "uploading range");
        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        check(response, &url)?;

        info!(cid = %job.correlation_id, path = %job.local_path.display(), bytes = length, "upload finished");
        Ok(length)
    }

    async fn download(&self, job: &FileTransferJob) -> Result<u64, TransferError> {
        let local_len = fs::metadata(&job.local_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let offset = resume_offset(local_len, job.expected_size);

        let url = self.url("/file/download", &[("_cid", job.correlation_id.as_str())]);
        debug!(%url, offset, local_len, "downloading");
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .await?;
        let mut response = check(response, &url)?;

        // Nothing touches the disk until the endpoint has agreed to serve.
        if let Some(parent) = job.local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&job.local_path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut written = 0u64;
        while let Some(bytes) = response.chunk().await? {
            for piece in bytes.chunks(WRITE_CHUNK) {
                file.write_all(piece).await?;
                written += piece.len() as u64;
            }
        }
        // A restart from zero may leave a longer stale copy behind.
        file.set_len(offset + written).await?;
        file.flush().await?;

        info!(cid = %job.correlation_id, path = %job.local_path.display(), offset, bytes = written, "download finished");
        Ok(written)
    }

    /// Post the result of an `apiOffer` to `POST /api/answer`.
    pub async fn api_answer<T: Serialize + ?Sized>(
        &self,
        cid: &str,
        data: &T,
    ) -> Result<(), TransferError> {
        let url = self.url("/api/answer", &[("_cid", cid)]);
        let response = self.client.post(url.clone()).json(data).send().await?;
        check(response, &url)?;
        Ok(())
    }
}

fn check(response: Response, url: &Url) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransferError::Status {
            status,
            url: url.to_string(),
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
