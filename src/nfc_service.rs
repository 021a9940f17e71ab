// src/nfc_service.rs
//! The one long-lived NFC service. Owns the session, picks the live or
//! simulated path for every operation and keeps hardware work off the
//! async request handlers.

use crossbeam_channel::Sender;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::broadcast;
use tokio::task;

use crate::config::Config;
use crate::error::{NfcError, Result};
use crate::geometry::{NTAG216, TagGeometry, TagType, TagTypeInfo};
use crate::ndef::{self, EMPTY_NDEF_MESSAGE};
use crate::pages;
use crate::session::{self, HardwareCapability, HardwareEvent, Route, Session, TagPresence};
use crate::simulation;
use crate::types::{
    FormatData, OperationResult, OutgoingMessage, ReadData, ReaderInfo, StatusReport,
    SupportedType, WriteData,
};

const EVENT_BROADCAST_CAPACITY: usize = 100;

pub struct NfcService {
    session: Arc<Mutex<Session>>,
    geometry: &'static TagGeometry,
    language: String,
    read_pages: usize,
    events: broadcast::Sender<OutgoingMessage>,
}

impl NfcService {
    pub fn new(config: &Config, capability: HardwareCapability) -> Self {
        let geometry = TagGeometry::lookup(config.tag_family).unwrap_or_else(|| {
            warn!(
                "{} has no NTAG21x layout, falling back to {}",
                config.tag_family, NTAG216.tag_type
            );
            &NTAG216
        });
        if !capability.available {
            warn!("PC/SC unavailable, every NFC operation will be simulated");
        }

        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            session: Arc::new(Mutex::new(Session::new(
                capability,
                geometry.tag_type,
                config.apdu_timeout(),
            ))),
            geometry,
            language: config.language.clone(),
            read_pages: config.read_pages,
            events,
        }
    }

    /// Starts the thread that applies hardware events to the session and
    /// returns the sending side for the PC/SC monitor.
    pub fn spawn_event_loop(&self) -> Result<Sender<HardwareEvent>> {
        let (tx, rx) = session::event_channel();
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        thread::Builder::new()
            .name("nfc-events".into())
            .spawn(move || session::consume_events(session, rx, events))
            .map_err(|e| NfcError::Transport(format!("failed to start event loop: {}", e)))?;
        Ok(tx)
    }

    /// Applies one event inline, bypassing the event thread.
    #[cfg(test)]
    pub fn handle_event(&self, event: HardwareEvent) {
        let msg = session::lock(&self.session).apply(event);
        if let Some(msg) = msg {
            let _ = self.events.send(msg);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutgoingMessage> {
        self.events.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        let session = session::lock(&self.session);
        let current_tag = session.current_tag().map(TagPresence::view);
        StatusReport {
            state: session.state(),
            available: session.capability().available,
            connected: session.connected(),
            simulated: session.is_simulated(),
            reader_count: session.reader_count(),
            tag_present: current_tag.is_some(),
            current_tag,
            supported_type: self.geometry.tag_type.display_name(),
            capacity_bytes: self.geometry.usable_memory_bytes,
        }
    }

    /// Attached readers, or the simulated one when there are none.
    pub fn list_readers(&self) -> Vec<ReaderInfo> {
        let session = session::lock(&self.session);
        let readers: Vec<ReaderInfo> = session
            .readers()
            .map(|r| ReaderInfo {
                name: r.name.clone(),
                connected: r.connected,
                simulated: false,
                supported_type: self.geometry.tag_type.display_name(),
            })
            .collect();
        if readers.is_empty() {
            return vec![simulation::simulated_reader(self.geometry)];
        }
        readers
    }

    pub async fn read_tag(&self, reader: Option<&str>) -> OperationResult<ReadData> {
        let (link, tag) = match self.route(reader) {
            Ok(Route::Live { link, tag }) => (link, tag),
            Ok(Route::Simulated) => return simulation::read(self.geometry),
            Err(e) => return failed("Read", e),
        };
        let geometry = self.geometry_for(&tag);
        let initial_pages = self.read_pages;

        let read = blocking(move || {
            let mut link = link;
            Ok(pages::read_ndef_window(&mut link, geometry, initial_pages))
        })
        .await;
        let mut read = match read {
            Ok(read) => read,
            Err(e) => return failed("Read", e),
        };

        if read.bytes.is_empty() {
            if let Some(e) = read.error {
                return failed("Read", e);
            }
        } else if let Some(e) = &read.error {
            warn!("Decoding {} byte(s) left by an interrupted read: {}", read.bytes.len(), e);
        }

        if let Some((_, end)) = ndef::tlv_extent(&read.bytes) {
            read.bytes.truncate(end);
        }

        OperationResult::live(ReadData {
            uid: hex::encode_upper(&tag.uid),
            tag_type: tag.derived_type,
            capacity_bytes: geometry.usable_memory_bytes,
            atr: tag.atr.as_deref().map(hex::encode_upper),
            decoded_payload: ndef::decode_ndef(&read.bytes),
        })
    }

    pub async fn write_tag(&self, payload: &Value, reader: Option<&str>) -> OperationResult<WriteData> {
        let route = match self.route(reader) {
            Ok(route) => route,
            Err(e) => return failed("Write", e),
        };
        let geometry = match &route {
            Route::Live { tag, .. } => self.geometry_for(tag),
            Route::Simulated => self.geometry,
        };

        let buffer = match ndef::begin_encoding(payload, &self.language) {
            Ok(buffer) if buffer.len() > geometry.max_ndef_payload_bytes => {
                return failed(
                    "Write",
                    NfcError::CapacityExceeded {
                        size: buffer.len(),
                        max: geometry.max_ndef_payload_bytes,
                    },
                );
            }
            Ok(buffer) => buffer,
            Err(e) => return failed("Write", e),
        };
        let encoded_len = buffer.len();

        let (link, tag) = match route {
            Route::Live { link, tag } => (link, tag),
            Route::Simulated => return simulation::write(geometry, encoded_len),
        };

        let reader_name = link.name().to_string();
        let written = blocking(move || {
            let mut link = link;
            pages::write_buffer(&mut link, geometry, &buffer)
        })
        .await;
        if let Err(e) = written {
            return failed("Write", e);
        }

        info!(
            "Wrote {} byte(s) to tag {} on {}",
            encoded_len,
            hex::encode_upper(&tag.uid),
            reader_name
        );
        OperationResult::live(WriteData {
            uid: hex::encode_upper(&tag.uid),
            tag_type: tag.derived_type,
            bytes_written: encoded_len,
            capacity_remaining: geometry.max_ndef_payload_bytes.saturating_sub(encoded_len),
        })
    }

    /// Writes an empty NDEF message over the start of the data window.
    pub async fn format_tag(&self, reader: Option<&str>) -> OperationResult<FormatData> {
        let (link, tag) = match self.route(reader) {
            Ok(Route::Live { link, tag }) => (link, tag),
            Ok(Route::Simulated) => return simulation::format(self.geometry),
            Err(e) => return failed("Format", e),
        };
        let geometry = self.geometry_for(&tag);
        let reader_name = link.name().to_string();

        let written = blocking(move || {
            let mut link = link;
            pages::write_buffer(&mut link, geometry, &EMPTY_NDEF_MESSAGE)
        })
        .await;
        if let Err(e) = written {
            return failed("Format", e);
        }

        info!("Formatted tag {} on {}", hex::encode_upper(&tag.uid), reader_name);
        OperationResult::live(FormatData {
            message: format!("{} formatted", tag.derived_type),
        })
    }

    pub fn tag_type_info(&self) -> TagTypeInfo {
        self.geometry.info()
    }

    pub fn supported_types(&self) -> Vec<SupportedType> {
        TagType::ALL
            .iter()
            .map(|t| SupportedType {
                id: t.id(),
                name: t.display_name(),
            })
            .collect()
    }

    /// Drops every reader and the current tag. Pending operations keep the
    /// links they already hold.
    pub fn shutdown(&self) {
        session::lock(&self.session).clear();
        info!("NFC service stopped");
    }

    fn route(&self, reader: Option<&str>) -> Result<Route> {
        session::lock(&self.session).route(reader)
    }

    /// Tags the ATR maps to a non NTAG family still get the deployment
    /// layout; page access is the same for every Type 2 tag we write.
    fn geometry_for(&self, tag: &TagPresence) -> &'static TagGeometry {
        TagGeometry::lookup(tag.derived_type).unwrap_or(self.geometry)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|e| NfcError::Transport(format!("hardware task failed: {}", e)))?
}

fn failed<T>(operation: &str, e: NfcError) -> OperationResult<T> {
    if e.is_apdu_failure() {
        error!("{} failed on the tag: {}", operation, e);
    } else {
        warn!("{} rejected: {}", operation, e);
    }
    OperationResult::failed(e)
}
