// src/session.rs
//! Registry of attached readers and the tag currently presented, driven by
//! hardware events arriving over a bounded channel.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

use crate::apdu::CardTransport;
use crate::error::{NfcError, Result};
use crate::geometry::{TagType, tag_type_from_atr};
use crate::reader::ReaderLink;
use crate::simulation::SIMULATED_READER_NAME;
use crate::types::{OutgoingMessage, TagView};

pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Whether PC/SC could be loaded at startup. Decided once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapability {
    pub available: bool,
}

/// What the PC/SC layer reports. The session never produces these itself.
pub enum HardwareEvent {
    ReaderAttached {
        name: String,
        transport: Box<dyn CardTransport>,
    },
    ReaderDetached {
        name: String,
    },
    TagInserted {
        reader: String,
        uid: Vec<u8>,
        atr: Option<Vec<u8>>,
    },
    TagRemoved {
        reader: String,
    },
}

impl fmt::Debug for HardwareEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareEvent::ReaderAttached { name, .. } => {
                f.debug_struct("ReaderAttached").field("name", name).finish()
            }
            HardwareEvent::ReaderDetached { name } => {
                f.debug_struct("ReaderDetached").field("name", name).finish()
            }
            HardwareEvent::TagInserted { reader, uid, atr } => f
                .debug_struct("TagInserted")
                .field("reader", reader)
                .field("uid", &hex::encode_upper(uid))
                .field("atr", &atr.as_deref().map(hex::encode_upper))
                .finish(),
            HardwareEvent::TagRemoved { reader } => {
                f.debug_struct("TagRemoved").field("reader", reader).finish()
            }
        }
    }
}

pub fn event_channel() -> (Sender<HardwareEvent>, Receiver<HardwareEvent>) {
    bounded(EVENT_QUEUE_CAPACITY)
}

#[derive(Debug)]
pub struct ReaderHandle {
    pub name: String,
    pub link: ReaderLink,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct TagPresence {
    pub uid: Vec<u8>,
    pub atr: Option<Vec<u8>>,
    pub derived_type: TagType,
    pub reader_name: String,
    pub detected_at: SystemTime,
}

impl TagPresence {
    pub fn view(&self) -> TagView {
        TagView {
            uid: hex::encode_upper(&self.uid),
            atr: self.atr.as_deref().map(hex::encode_upper),
            tag_type: self.derived_type,
            reader: self.reader_name.clone(),
            detected_at: self
                .detected_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    NoHardwareLibrary,
    WaitingForReader,
    ReaderConnected,
    TagPresent,
}

/// Where an operation should go.
#[derive(Debug)]
pub enum Route {
    Simulated,
    Live { link: ReaderLink, tag: TagPresence },
}

#[derive(Debug)]
pub struct Session {
    capability: HardwareCapability,
    deployment_type: TagType,
    apdu_timeout: Duration,
    readers: BTreeMap<String, ReaderHandle>,
    current_tag: Option<TagPresence>,
    shut_down: bool,
}

impl Session {
    pub fn new(capability: HardwareCapability, deployment_type: TagType, apdu_timeout: Duration) -> Self {
        Self {
            capability,
            deployment_type,
            apdu_timeout,
            readers: BTreeMap::new(),
            current_tag: None,
            shut_down: false,
        }
    }

    pub fn capability(&self) -> HardwareCapability {
        self.capability
    }

    pub fn connected(&self) -> bool {
        self.capability.available && !self.shut_down
    }

    pub fn state(&self) -> SessionState {
        if !self.capability.available {
            SessionState::NoHardwareLibrary
        } else if self.readers.is_empty() {
            SessionState::WaitingForReader
        } else if self.current_tag.is_none() {
            SessionState::ReaderConnected
        } else {
            SessionState::TagPresent
        }
    }

    /// True whenever a real read or write could not be carried out.
    pub fn is_simulated(&self) -> bool {
        self.state() != SessionState::TagPresent
    }

    pub fn readers(&self) -> impl Iterator<Item = &ReaderHandle> {
        self.readers.values()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn current_tag(&self) -> Option<&TagPresence> {
        self.current_tag.as_ref()
    }

    /// Picks the live reader for an operation, or simulation. Naming a
    /// reader that is not attached is an error; everything else degrades
    /// to simulation. Only the reader holding the current tag goes live.
    pub fn route(&self, requested: Option<&str>) -> Result<Route> {
        if let Some(name) = requested {
            if !self.readers.contains_key(name) {
                if name == SIMULATED_READER_NAME && self.is_simulated() {
                    return Ok(Route::Simulated);
                }
                return Err(NfcError::NoReaderPresent(name.to_string()));
            }
        }

        if !self.capability.available {
            return Ok(Route::Simulated);
        }
        let Some(tag) = &self.current_tag else {
            return Ok(Route::Simulated);
        };
        if requested.is_some_and(|name| name != tag.reader_name) {
            return Ok(Route::Simulated);
        }
        match self.readers.get(&tag.reader_name) {
            Some(handle) => Ok(Route::Live {
                link: handle.link.clone(),
                tag: tag.clone(),
            }),
            None => Ok(Route::Simulated),
        }
    }

    /// Applies one hardware event and returns what subscribers should hear.
    pub fn apply(&mut self, event: HardwareEvent) -> Option<OutgoingMessage> {
        match event {
            HardwareEvent::ReaderAttached { name, transport } => {
                let link = match ReaderLink::spawn(&name, transport, self.apdu_timeout) {
                    Ok(link) => link,
                    Err(e) => {
                        error!("Could not register reader {}: {}", name, e);
                        return None;
                    }
                };
                info!("NFC reader detected: {}", name);
                self.readers.insert(
                    name.clone(),
                    ReaderHandle {
                        name: name.clone(),
                        link,
                        connected: true,
                    },
                );
                Some(OutgoingMessage::ReaderAttached { reader: name })
            }
            HardwareEvent::ReaderDetached { name } => {
                if self.readers.remove(&name).is_none() {
                    return None;
                }
                info!("NFC reader disconnected: {}", name);
                if self
                    .current_tag
                    .as_ref()
                    .is_some_and(|t| t.reader_name == name)
                {
                    self.current_tag = None;
                }
                Some(OutgoingMessage::ReaderDetached { reader: name })
            }
            HardwareEvent::TagInserted { reader, uid, atr } => {
                if !self.readers.contains_key(&reader) {
                    warn!("Tag reported on unknown reader {}, ignoring", reader);
                    return None;
                }
                let tag = TagPresence {
                    derived_type: tag_type_from_atr(atr.as_deref(), self.deployment_type),
                    uid,
                    atr,
                    reader_name: reader,
                    detected_at: SystemTime::now(),
                };
                info!(
                    "Tag {} ({}) detected on {}",
                    hex::encode_upper(&tag.uid),
                    tag.derived_type,
                    tag.reader_name
                );
                let view = tag.view();
                self.current_tag = Some(tag);
                Some(OutgoingMessage::TagPresent { tag: view })
            }
            HardwareEvent::TagRemoved { reader } => {
                match &self.current_tag {
                    Some(tag) if tag.reader_name == reader => {
                        info!("Tag {} removed", hex::encode_upper(&tag.uid));
                        self.current_tag = None;
                    }
                    _ => return None,
                }
                Some(OutgoingMessage::TagRemoved { reader })
            }
        }
    }

    /// Forgets every reader and the current tag. Reader workers stop once
    /// their last link is dropped.
    pub fn clear(&mut self) {
        self.readers.clear();
        self.current_tag = None;
        self.shut_down = true;
    }
}

pub fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drains hardware events into the session until every sender is gone.
pub fn consume_events(
    session: Arc<Mutex<Session>>,
    rx: Receiver<HardwareEvent>,
    outgoing: broadcast::Sender<OutgoingMessage>,
) {
    for event in rx.iter() {
        debug!("Hardware event: {:?}", event);
        let msg = lock(&session).apply(event);
        if let Some(msg) = msg {
            // No subscribers is fine
            let _ = outgoing.send(msg);
        }
    }
    info!("Hardware event stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::mock::MockTag;
    use crate::geometry::DEFAULT_TAG_TYPE;

    const READER: &str = "ACS ACR122U PICC Interface";

    fn live_session() -> Session {
        Session::new(
            HardwareCapability { available: true },
            DEFAULT_TAG_TYPE,
            Duration::from_secs(1),
        )
    }

    fn attach(session: &mut Session, name: &str) {
        session.apply(HardwareEvent::ReaderAttached {
            name: name.into(),
            transport: Box::new(MockTag::new(231)),
        });
    }

    fn insert(session: &mut Session, reader: &str) {
        session.apply(HardwareEvent::TagInserted {
            reader: reader.into(),
            uid: vec![0x04, 1, 2, 3, 4, 5, 6],
            atr: Some(vec![0x3B, 0x8F, 0x80, 0x01, 0x00, 0x42]),
        });
    }

    #[test]
    fn lifecycle_transitions() {
        let mut s = live_session();
        assert_eq!(s.state(), SessionState::WaitingForReader);
        assert!(s.is_simulated());

        attach(&mut s, READER);
        assert_eq!(s.state(), SessionState::ReaderConnected);
        assert!(s.is_simulated());

        insert(&mut s, READER);
        assert_eq!(s.state(), SessionState::TagPresent);
        assert!(!s.is_simulated());
        assert_eq!(s.current_tag().unwrap().derived_type, TagType::Ntag215);

        let msg = s.apply(HardwareEvent::TagRemoved {
            reader: READER.into(),
        });
        assert!(matches!(msg, Some(OutgoingMessage::TagRemoved { .. })));
        assert_eq!(s.state(), SessionState::ReaderConnected);

        s.apply(HardwareEvent::ReaderDetached {
            name: READER.into(),
        });
        assert_eq!(s.state(), SessionState::WaitingForReader);
    }

    #[test]
    fn without_pcsc_everything_is_simulated() {
        let mut s = Session::new(
            HardwareCapability { available: false },
            DEFAULT_TAG_TYPE,
            Duration::from_secs(1),
        );
        assert_eq!(s.state(), SessionState::NoHardwareLibrary);
        attach(&mut s, READER);
        insert(&mut s, READER);
        assert_eq!(s.state(), SessionState::NoHardwareLibrary);
        assert!(matches!(s.route(None).unwrap(), Route::Simulated));
    }

    #[test]
    fn removal_from_another_reader_keeps_the_tag() {
        let mut s = live_session();
        attach(&mut s, READER);
        attach(&mut s, "second");
        insert(&mut s, READER);

        assert!(
            s.apply(HardwareEvent::TagRemoved {
                reader: "second".into()
            })
            .is_none()
        );
        assert!(s.current_tag().is_some());

        s.apply(HardwareEvent::ReaderDetached {
            name: "second".into(),
        });
        assert!(s.current_tag().is_some());

        s.apply(HardwareEvent::ReaderDetached {
            name: READER.into(),
        });
        assert!(s.current_tag().is_none());
    }

    #[test]
    fn tag_on_unknown_reader_is_ignored() {
        let mut s = live_session();
        attach(&mut s, READER);
        insert(&mut s, "ghost");
        assert!(s.current_tag().is_none());
    }

    #[test]
    fn routing() {
        let mut s = live_session();
        assert!(matches!(s.route(None).unwrap(), Route::Simulated));
        assert!(matches!(
            s.route(Some(SIMULATED_READER_NAME)).unwrap(),
            Route::Simulated
        ));
        assert!(matches!(
            s.route(Some("missing")),
            Err(NfcError::NoReaderPresent(_))
        ));

        attach(&mut s, READER);
        assert!(matches!(s.route(Some(READER)).unwrap(), Route::Simulated));

        insert(&mut s, READER);
        match s.route(None).unwrap() {
            Route::Live { link, tag } => {
                assert_eq!(link.name(), READER);
                assert_eq!(tag.reader_name, READER);
            }
            Route::Simulated => panic!("expected a live route"),
        }
        assert!(matches!(
            s.route(Some(SIMULATED_READER_NAME)),
            Err(NfcError::NoReaderPresent(_))
        ));
    }

    #[test]
    fn named_reader_without_the_tag_is_simulated() {
        let mut s = live_session();
        attach(&mut s, READER);
        attach(&mut s, "second");
        insert(&mut s, READER);

        assert!(matches!(s.route(Some("second")).unwrap(), Route::Simulated));
        match s.route(Some(READER)).unwrap() {
            Route::Live { link, tag } => {
                assert_eq!(link.name(), READER);
                assert_eq!(tag.reader_name, READER);
            }
            Route::Simulated => panic!("expected a live route"),
        }
    }

    #[test]
    fn consumer_applies_events_from_other_threads() {
        let session = Arc::new(Mutex::new(live_session()));
        let (tx, rx) = event_channel();
        let (out_tx, mut out_rx) = broadcast::channel(16);

        let consumer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || consume_events(session, rx, out_tx))
        };

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    tx.send(HardwareEvent::ReaderAttached {
                        name: format!("reader-{}", i),
                        transport: Box::new(MockTag::new(231)),
                    })
                    .unwrap();
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        drop(tx);
        consumer.join().unwrap();

        assert_eq!(lock(&session).reader_count(), 4);
        let mut attached = 0;
        while let Ok(msg) = out_rx.try_recv() {
            assert!(matches!(msg, OutgoingMessage::ReaderAttached { .. }));
            attached += 1;
        }
        assert_eq!(attached, 4);
    }

    #[test]
    fn clear_forgets_everything() {
        let mut s = live_session();
        attach(&mut s, READER);
        insert(&mut s, READER);
        s.clear();
        assert_eq!(s.reader_count(), 0);
        assert!(s.current_tag().is_none());
        assert!(!s.connected());
    }
}
