//! Remote control service
//!
//! Wires the bus client to the relay and signaling handlers. The handlers are
//! registered the first time the connection opens; reconnects reuse them.
//! Progress is published on a `watch` channel so callers can wait for the
//! connection to come up or fail.

use std::sync::{Arc, Weak};

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use crate::bus::{MessageBus, MessageBusClient, CLOSE_AUTH_FAILED, CLOSE_NORMAL};
use crate::capture::{CaptureDevice, CaptureKind, CapturePool, DeclaredCapture};
use crate::config::FileConfig;
use crate::credentials::{CredentialStore, Credentials};
use crate::engine::{MediaEngine, RtcEngine};
use crate::error::{BusError, ServiceError};
use crate::files::{FileCatalog, LocalFiles};
use crate::model::envelope::SendMessage;
use crate::relay::{BackgroundTasks, DataEndpoint, RelayFileProtocol, TaskQueue};
use crate::signaling::SignalingCoordinator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    /// Connected, authenticated, handlers registered.
    Running,
    /// The bus rejected the stored credentials; they have been cleared.
    AuthRejected,
    Closed { code: u16, reason: String },
    Failed(String),
}

impl ServiceStatus {
    /// The service will not make progress on its own from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::AuthRejected | ServiceStatus::Closed { .. } | ServiceStatus::Failed(_)
        )
    }
}

/// External collaborators the service drives.
pub struct Collaborators {
    pub engine: Arc<dyn MediaEngine>,
    pub capture: Arc<dyn CaptureDevice>,
    pub catalog: Arc<dyn FileCatalog>,
    pub tasks: Arc<dyn TaskQueue>,
}

impl Collaborators {
    /// The stock set: str0m engine, declared capture, local filesystem and
    /// tokio background tasks against the configured data endpoint.
    pub fn local(config: &FileConfig) -> Result<Self, ServiceError> {
        let catalog: Arc<dyn FileCatalog> = Arc::new(LocalFiles);
        let endpoint = DataEndpoint::new(&config.data.url)?;
        Ok(Self {
            engine: Arc::new(RtcEngine::default()),
            capture: Arc::new(DeclaredCapture::new(config.media.capture_settings())),
            tasks: Arc::new(BackgroundTasks::new(endpoint, catalog.clone())),
            catalog,
        })
    }
}

/// Connect URL: the bus URL with the device's credentials and realm as
/// query parameters.
pub fn connect_url(
    bus_url: &str,
    access_key: &str,
    credentials: &Credentials,
) -> Result<Url, ServiceError> {
    if credentials.token.is_empty() {
        return Err(ServiceError::MissingCredential("token"));
    }
    if credentials.device_id.is_empty() {
        return Err(ServiceError::MissingCredential("device_id"));
    }

    let mut url = Url::parse(bus_url)?;
    url.query_pairs_mut()
        .append_pair("token", &credentials.token)
        .append_pair("name", &credentials.device_id)
        .append_pair("room_ids", &credentials.device_id)
        .append_pair("realm", access_key);
    Ok(url)
}

pub struct RemoteControlService {
    bus: MessageBusClient,
    credentials: Credentials,
    store: Arc<dyn CredentialStore>,
    relay: Arc<RelayFileProtocol>,
    signaling: Arc<SignalingCoordinator>,
    status: watch::Sender<ServiceStatus>,
}

impl RemoteControlService {
    pub fn new(
        config: &FileConfig,
        store: Arc<dyn CredentialStore>,
        parts: Collaborators,
    ) -> Result<Self, ServiceError> {
        let credentials = store.load()?;
        let url = connect_url(&config.bus.url, &config.bus.access_key, &credentials)?;
        let bus = MessageBusClient::new(url.as_str(), config.bus.options());
        let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());

        let relay = Arc::new(RelayFileProtocol::new(
            shared.clone(),
            parts.catalog,
            parts.tasks,
        ));
        let signaling = Arc::new(SignalingCoordinator::new(
            shared,
            parts.engine,
            CapturePool::new(parts.capture.clone(), CaptureKind::Camera),
            CapturePool::new(parts.capture, CaptureKind::Screen),
        ));
        let (status, _) = watch::channel(ServiceStatus::Starting);

        Ok(Self {
            bus,
            credentials,
            store,
            relay,
            signaling,
            status,
        })
    }

    /// Connect and return a receiver for status updates.
    pub fn start(&self) -> watch::Receiver<ServiceStatus> {
        // The bus owns this listener; it must not keep the handlers alive.
        let relay: Weak<RelayFileProtocol> = Arc::downgrade(&self.relay);
        let signaling: Weak<SignalingCoordinator> = Arc::downgrade(&self.signaling);
        let status = self.status.clone();
        self.bus.on_open(Arc::new(move || {
            let (Some(relay), Some(signaling)) = (relay.upgrade(), signaling.upgrade()) else {
                return;
            };
            relay.register();
            signaling.register();
            status.send_replace(ServiceStatus::Running);
        }));

        let store = self.store.clone();
        let status = self.status.clone();
        self.bus.on_closed(Arc::new(move |code: u16, reason: &str| {
            let next = match code {
                CLOSE_AUTH_FAILED => {
                    if let Err(e) = store.clear() {
                        error!(error = %e, "could not clear rejected credentials");
                    }
                    ServiceStatus::AuthRejected
                }
                _ => ServiceStatus::Closed {
                    code,
                    reason: reason.to_string(),
                },
            };
            warn!(?next, "remote control stopped");
            status.send_replace(next);
        }));

        let status = self.status.clone();
        self.bus.on_failure(Arc::new(move |err: &BusError| {
            status.send_replace(ServiceStatus::Failed(err.to_string()));
        }));

        info!(url = %redact(self.bus.url()), "starting remote control");
        self.bus.connect();
        self.status.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub fn bus(&self) -> &MessageBusClient {
        &self.bus
    }

    /// Tell the operator client this device is leaving, stop all sessions and
    /// close the bus with the normal close code.
    pub fn shutdown(&self) {
        if !self.credentials.client_id.is_empty() {
            let logout = json!({ "msgType": "logout" }).to_string();
            self.bus
                .send(SendMessage::to_name(self.credentials.client_id.clone(), logout));
        }
        self.signaling.shutdown();
        self.relay.unregister();
        self.bus.close("service stopped");
        info!(code = CLOSE_NORMAL, "remote control shut down");
    }
}

/// Strip the query (it carries the token) before logging a URL.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            token: "tok en".into(),
            device_id: "dev-7".into(),
            client_id: "cli-7".into(),
        }
    }

    #[test]
    fn connect_url_carries_identity() {
        let url = connect_url("wss://push.example.com/ws", "realm-x", &creds()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://push.example.com/ws?token=tok+en&name=dev-7&room_ids=dev-7&realm=realm-x"
        );
    }

    #[test]
    fn connect_url_needs_token_and_device() {
        let missing = Credentials {
            token: String::new(),
            ..creds()
        };
        assert!(matches!(
            connect_url("ws://h/ws", "", &missing),
            Err(ServiceError::MissingCredential("token"))
        ));
        assert!(matches!(
            connect_url("not a url", "", &creds()),
            Err(ServiceError::Url(_))
        ));
    }

    #[tokio::test]
    async fn started_service_does_not_pin_its_handlers() {
        let mut config = FileConfig::default();
        config.bus.url = "ws://127.0.0.1:9/ws".into();
        let store = Arc::new(crate::credentials::MemoryCredentialStore::new(creds()));
        let parts = Collaborators::local(&config).unwrap();
        let service = RemoteControlService::new(&config, store, parts).unwrap();
        let _status = service.start();

        assert_eq!(Arc::strong_count(&service.relay), 1);
        assert_eq!(Arc::strong_count(&service.signaling), 1);

        let relay = Arc::downgrade(&service.relay);
        let signaling = Arc::downgrade(&service.signaling);
        drop(service);
        assert!(relay.upgrade().is_none());
        assert!(signaling.upgrade().is_none());
    }

    #[test]
    fn redact_drops_query() {
        assert_eq!(redact("ws://h/ws?token=secret"), "ws://h/ws");
        assert!(ServiceStatus::AuthRejected.is_terminal());
        assert!(!ServiceStatus::Running.is_terminal());
    }
}
