//! Best-effort registration of provisioned devices with the remote inventory.
//!
//! Submissions are queued on a channel and posted by a background thread so
//! a slow or unreachable inventory never holds up a provisioning run.

use espbatch_core::ProvisionRecord;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("building http client failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error("registration request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("remote returned error: ({0}) {1}")]
    Status(StatusCode, String),
}

/// Receives provision records for remote registration. Must not block.
pub trait RegistrationSink {
    fn submit(&self, record: &ProvisionRecord);
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UplinkSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub device_name: String,
    pub device_type: String,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: 10_000,
            device_name: "Unknown".to_string(),
            device_type: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
}

impl RegisterRequest {
    pub fn from_record(record: &ProvisionRecord, settings: &UplinkSettings) -> Self {
        Self {
            name: settings.device_name.clone(),
            device_id: record.device_identity.clone(),
            mac_address: record.mac.clone(),
            device_type: settings.device_type.clone(),
        }
    }
}

pub struct UplinkDispatcher {
    settings: UplinkSettings,
    tx: Option<Sender<RegisterRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl UplinkDispatcher {
    /// A dispatcher that drops every submission; used when no endpoint is configured.
    pub fn disabled() -> Self {
        Self {
            settings: UplinkSettings::default(),
            tx: None,
            worker: None,
        }
    }

    pub fn spawn(settings: UplinkSettings) -> Result<Self, UplinkError> {
        let Some(endpoint) = settings.endpoint.clone() else {
            info!("no registration endpoint configured, remote registration disabled");
            return Ok(Self::disabled());
        };
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(UplinkError::Client)?;
        let api_key = settings.api_key.clone();
        let (tx, rx) = mpsc::channel::<RegisterRequest>();
        let worker = thread::Builder::new()
            .name("espbatch-uplink".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    match post_registration(&client, &endpoint, api_key.as_deref(), &request) {
                        Ok(status) => {
                            info!(device_id = %request.device_id, status = %status, "device registered")
                        }
                        Err(err) => {
                            warn!(device_id = %request.device_id, error = %err, "device registration failed")
                        }
                    }
                }
                debug!("uplink queue closed");
            })
            .map_err(|err| {
                warn!(error = %err, "could not start uplink thread, remote registration disabled");
            })
            .ok();
        if worker.is_none() {
            return Ok(Self::disabled());
        }
        Ok(Self {
            settings,
            tx: Some(tx),
            worker,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Closes the queue and waits for pending registrations to be attempted.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("uplink thread panicked");
            }
        }
    }
}

impl RegistrationSink for UplinkDispatcher {
    fn submit(&self, record: &ProvisionRecord) {
        let Some(tx) = &self.tx else {
            debug!(device_id = %record.device_identity, "registration skipped, uplink disabled");
            return;
        };
        let request = RegisterRequest::from_record(record, &self.settings);
        if tx.send(request).is_err() {
            warn!(device_id = %record.device_identity, "uplink queue closed, registration dropped");
        }
    }
}

impl Drop for UplinkDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn post_registration(
    client: &Client,
    endpoint: &str,
    api_key: Option<&str>,
    request: &RegisterRequest,
) -> Result<StatusCode, UplinkError> {
    debug!(endpoint, device_id = %request.device_id, "posting registration");
    let mut builder = client.post(endpoint).json(request);
    if let Some(key) = api_key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    let response = builder.send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(UplinkError::Status(status, body));
    }
    Ok(status)
}
