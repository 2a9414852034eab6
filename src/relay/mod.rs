//! File relay protocol
//!
//! Handlers for the `httpRelay@*` requests. Every request that decodes gets
//! exactly one `<msgType>Answer` reply on the bus carrying a
//! `{code, msg, data}` status; transfers and listings run afterwards in the
//! background and report through the data endpoint, never on the bus.

mod tasks;
mod transfer;

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use tasks::{BackgroundTasks, RelayTask, TaskQueue};
pub use transfer::{resume_offset, DataEndpoint, FileTransferJob, TransferDirection, WRITE_CHUNK};

use crate::bus::{ListenerId, MessageBus};
use crate::error::RelayError;
use crate::files::FileCatalog;
use crate::model::envelope::{answer_type, MessageContent, ReceiveMessage, Reply, SendMessage};
use crate::model::relay::{
    ApiOffer, DownloadRequest, FileInfoRequest, FileSummary, ListQuery, UploadRequest, API_OFFER,
    FILE_RECEIVE_READY, FILE_UPLOAD, GET_FILE_INFO, GET_FILE_LIST,
};
use crate::util::lock;

#[cfg(test)]
pub(crate) use tasks::testing;

struct Inner {
    bus: Arc<dyn MessageBus>,
    catalog: Arc<dyn FileCatalog>,
    tasks: Arc<dyn TaskQueue>,
    listener: Mutex<Option<ListenerId>>,
}

#[derive(Clone)]
pub struct RelayFileProtocol {
    inner: Arc<Inner>,
}

impl RelayFileProtocol {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        catalog: Arc<dyn FileCatalog>,
        tasks: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                catalog,
                tasks,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start handling relay requests. Calling it again is a no-op.
    pub fn register(&self) {
        let mut listener = lock(&self.inner.listener);
        if listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .bus
            .on_message(Arc::new(move |message: &ReceiveMessage| {
                if let Some(inner) = weak.upgrade() {
                    RelayFileProtocol { inner }.handle(message);
                }
            }));
        *listener = Some(id);
        info!("relay handler registered");
    }

    pub fn unregister(&self) {
        if let Some(id) = lock(&self.inner.listener).take() {
            self.inner.bus.remove_on_message(id);
        }
    }

    /// Dispatch one bus message. Anything that is not a relay request is
    /// ignored.
    pub fn handle(&self, message: &ReceiveMessage) {
        let Ok(content) = message.decode_content() else {
            return;
        };
        let result = match content.msg_type.as_str() {
            GET_FILE_INFO => self.get_file_info(&content.payload),
            FILE_RECEIVE_READY => self.file_receive_ready(&content.payload),
            FILE_UPLOAD => self.file_upload(&content.payload),
            API_OFFER => self.api_offer(&content.payload),
            _ => return,
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e @ (RelayError::NotFound(_) | RelayError::UnsupportedMethod(_))) => {
                debug!(msg_type = %content.msg_type, error = %e, "answering 404");
                Reply::not_found(e.to_string())
            }
            Err(e @ RelayError::Protocol(_)) => {
                warn!(msg_type = %content.msg_type, sender = %message.sender, error = %e, "dropping relay request");
                return;
            }
        };
        self.reply(&message.sender, &content, reply);
    }

    fn reply(&self, to: &str, request: &MessageContent, reply: Reply) {
        let payload = match serde_json::to_value(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "could not encode reply");
                return;
            }
        };
        let content = MessageContent::new(
            answer_type(&request.msg_type),
            request.msg_id.clone(),
            payload,
        );
        match SendMessage::encode_to(to, &content) {
            Ok(message) => self.inner.bus.send(message),
            Err(e) => warn!(error = %e, "could not encode reply"),
        }
    }

    fn get_file_info(&self, payload: &Value) -> Result<Reply, RelayError> {
        let request: FileInfoRequest = decode(payload)?;
        let info = self
            .inner
            .catalog
            .file_info(Path::new(&request.path))
            .ok()
            .filter(|info| info.is_file)
            .ok_or_else(|| RelayError::NotFound(request.path.clone()))?;

        let summary = FileSummary {
            name: info.name,
            size: info.size,
            mime_type: info.mime_type,
            last_modified: info.last_modify_time,
        };
        Ok(Reply::ok_with(serde_json::to_value(summary)?))
    }

    fn file_receive_ready(&self, payload: &Value) -> Result<Reply, RelayError> {
        let request: UploadRequest = decode(payload)?;
        let path = urlencoding::decode(&request.path)
            .map_err(|_| RelayError::NotFound(request.path.clone()))?
            .into_owned();
        if !Path::new(&path).is_file() {
            return Err(RelayError::NotFound(path));
        }

        self.inner.tasks.submit(RelayTask::Transfer(FileTransferJob::upload(
            path,
            request.start,
            request.end,
            request.cid,
        )));
        Ok(Reply::ok())
    }

    fn file_upload(&self, payload: &Value) -> Result<Reply, RelayError> {
        let request: DownloadRequest = decode(payload)?;
        self.inner.tasks.submit(RelayTask::Transfer(FileTransferJob::download(
            request.query.save_path,
            request.file_info.size,
            request.cid,
        )));
        Ok(Reply::ok())
    }

    fn api_offer(&self, payload: &Value) -> Result<Reply, RelayError> {
        let offer: ApiOffer = decode(payload)?;
        if offer.method != GET_FILE_LIST {
            return Err(RelayError::UnsupportedMethod(offer.method));
        }

        let query: ListQuery = decode(&offer.query)?;
        self.inner.tasks.submit(RelayTask::ListFiles {
            cid: offer.cid,
            path: query.path.into(),
            offset: query.offset,
            size: query.size,
        });
        Ok(Reply::ok())
    }
}

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, RelayError> {
    Ok(serde_json::from_value(payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTasks;
    use super::*;
    use crate::bus::testing::MemoryBus;
    use crate::files::LocalFiles;
    use serde_json::json;
    use std::fs;

    struct Fixture {
        bus: Arc<MemoryBus>,
        tasks: Arc<RecordingTasks>,
        _protocol: RelayFileProtocol,
    }

    fn fixture() -> Fixture {
        let bus = MemoryBus::new();
        let tasks = Arc::new(RecordingTasks::default());
        let protocol = RelayFileProtocol::new(bus.clone(), Arc::new(LocalFiles), tasks.clone());
        protocol.register();
        Fixture {
            bus,
            tasks,
            _protocol: protocol,
        }
    }

    fn only_reply(bus: &MemoryBus) -> (MessageContent, Reply) {
        let sent = bus.sent_contents();
        assert_eq!(sent.len(), 1, "expected exactly one reply: {sent:?}");
        let reply = serde_json::from_value(sent[0].payload.clone()).unwrap();
        (sent[0].clone(), reply)
    }

    #[test]
    fn get_file_info_missing_is_404() {
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(GET_FILE_INFO, "1", json!({"path": "/no/such/file"})),
        );

        let (content, reply) = only_reply(&f.bus);
        assert_eq!(content.msg_type, "httpRelay@getFileInfoAnswer");
        assert_eq!(content.msg_id, "1");
        assert_eq!(reply.code, 404);
        assert_eq!(f.bus.sent()[0].names, vec!["op".to_string()]);
    }

    #[test]
    fn get_file_info_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, vec![0u8; 1234]).unwrap();

        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(GET_FILE_INFO, "2", json!({"path": path.to_str().unwrap()})),
        );

        let (_, reply) = only_reply(&f.bus);
        assert!(reply.is_ok());
        assert_eq!(reply.msg, "ok");
        assert_eq!(reply.data["name"], json!("report.pdf"));
        assert_eq!(reply.data["size"], json!(1234));
        assert_eq!(reply.data["mimeType"], json!("application/pdf"));
    }

    #[test]
    fn get_file_info_on_directory_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(
                GET_FILE_INFO,
                "3",
                json!({"path": dir.path().to_str().unwrap()}),
            ),
        );
        assert_eq!(only_reply(&f.bus).1.code, 404);
    }

    #[test]
    fn receive_ready_decodes_path_and_starts_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my file.txt");
        fs::write(&path, b"0123456789").unwrap();
        let encoded = urlencoding::encode(path.to_str().unwrap()).into_owned();

        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(
                FILE_RECEIVE_READY,
                "4",
                json!({"path": encoded, "start": 2, "end": 8, "cid": "c4"}),
            ),
        );

        assert!(only_reply(&f.bus).1.is_ok());
        assert_eq!(
            f.tasks.submitted(),
            vec![RelayTask::Transfer(FileTransferJob::upload(&path, 2, 8, "c4"))]
        );
    }

    #[test]
    fn receive_ready_missing_file_starts_nothing() {
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(
                FILE_RECEIVE_READY,
                "5",
                json!({"path": "%2Fno%2Fsuch", "start": 0, "end": 1, "cid": "c5"}),
            ),
        );
        let (_, reply) = only_reply(&f.bus);
        assert_eq!(reply.code, 404);
        assert_eq!(reply.msg, "file does not exist or has been deleted: /no/such");
        assert!(f.tasks.submitted().is_empty());
    }

    #[test]
    fn file_upload_starts_download() {
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(
                FILE_UPLOAD,
                "6",
                json!({
                    "fileInfo": {"name": "a.bin", "size": 300, "lastModified": 1, "mimeType": ""},
                    "query": {"save_path": "/data/a.bin"},
                    "cid": "c6"
                }),
            ),
        );
        assert!(only_reply(&f.bus).1.is_ok());
        assert_eq!(
            f.tasks.submitted(),
            vec![RelayTask::Transfer(FileTransferJob::download("/data/a.bin", 300, "c6"))]
        );
    }

    #[test]
    fn api_offer_lists_or_rejects() {
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(
                API_OFFER,
                "7",
                json!({"method": "getFileList", "query": {"path": "/sdcard", "size": 20}, "params": {}, "cid": "c7"}),
            ),
        );
        assert_eq!(
            f.tasks.submitted(),
            vec![RelayTask::ListFiles {
                cid: "c7".into(),
                path: "/sdcard".into(),
                offset: 0,
                size: 20,
            }]
        );

        f.bus.deliver(
            "op",
            &MessageContent::new(
                API_OFFER,
                "8",
                json!({"method": "reboot", "query": {}, "params": {}, "cid": "c8"}),
            ),
        );
        let replies = f.bus.sent_contents();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].msg_type, "httpRelay@apiOfferAnswer");
        let rejected: Reply = serde_json::from_value(replies[1].payload.clone()).unwrap();
        assert_eq!(rejected.code, 404);
        assert_eq!(rejected.msg, "remote method reboot does not exist");
        assert_eq!(f.tasks.submitted().len(), 1);
    }

    #[test]
    fn undecodable_payload_gets_no_reply() {
        let f = fixture();
        f.bus.deliver(
            "op",
            &MessageContent::new(FILE_UPLOAD, "9", json!({"cid": 3})),
        );
        f.bus.deliver(
            "op",
            &MessageContent::new("signaling@offer", "10", json!("v=0")),
        );
        assert!(f.bus.sent().is_empty());
        assert!(f.tasks.submitted().is_empty());
    }
}
