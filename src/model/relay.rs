//! File relay requests and the documents sent back for them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GET_FILE_INFO: &str = "httpRelay@getFileInfo";
pub const FILE_RECEIVE_READY: &str = "httpRelay@fileReceiveReady";
pub const FILE_UPLOAD: &str = "httpRelay@fileUpload";
pub const API_OFFER: &str = "httpRelay@apiOffer";

/// The only remote method an `apiOffer` can invoke.
pub const GET_FILE_LIST: &str = "getFileList";

/// `httpRelay@getFileInfo` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfoRequest {
    pub path: String,
    #[serde(default)]
    pub query: Value,
}

/// `httpRelay@fileReceiveReady` payload: the server is ready to receive
/// `[start, end)` of a local file. `path` arrives percent-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    #[serde(default)]
    pub start: u64,
    #[serde(default)]
    pub end: u64,
    pub cid: String,
}

/// `httpRelay@fileUpload` payload: the operator pushed a file that this
/// device should fetch from the data endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub file_info: RemoteFile,
    pub query: SaveQuery,
    pub cid: String,
}

/// Metadata of a file held by the data endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    #[serde(default)]
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveQuery {
    pub save_path: String,
}

/// `httpRelay@apiOffer` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiOffer {
    pub method: String,
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub params: Value,
    pub cid: String,
}

/// Query of a `getFileList` offer. A `size` of zero means no limit.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    pub path: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub size: usize,
}

/// Data of a successful `getFileInfo` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub last_modified: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn download_request_reads_nested_names() {
        let req: DownloadRequest = serde_json::from_value(json!({
            "fileInfo": {"name": "a.bin", "size": 10, "lastModified": 5, "mimeType": "x"},
            "query": {"save_path": "/tmp/a.bin"},
            "cid": "c1"
        }))
        .unwrap();
        assert_eq!(req.file_info.size, 10);
        assert_eq!(req.query.save_path, "/tmp/a.bin");
    }

    #[test]
    fn list_query_defaults_to_unbounded_window() {
        let q: ListQuery = serde_json::from_value(json!({"path": "/"})).unwrap();
        assert_eq!((q.offset, q.size), (0, 0));
    }
}
