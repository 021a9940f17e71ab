// src/monitor.rs
//! Watches PC/SC for readers coming and going and tags being presented,
//! and turns what it sees into [`HardwareEvent`]s.

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use pcsc::{Context, PNP_NOTIFICATION, ReaderState, Scope, State};
use std::ffi::{CStr, CString};
use std::thread;
use std::time::Duration;

use crate::apdu::{self, PcscCard};
use crate::error::{NfcError, Result};
use crate::session::HardwareEvent;

const READERS_BUF_LEN: usize = 2048;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct PcscMonitor {
    ctx: Context,
    poll_interval: Duration,
}

impl PcscMonitor {
    /// Fails with [`NfcError::HardwareUnavailable`] when the PC/SC service
    /// cannot be reached; the caller then runs simulated for good.
    pub fn establish(poll_interval: Duration) -> Result<Self> {
        let ctx = Context::establish(Scope::User).map_err(|e| {
            error!("Failed to establish PC/SC context: {}", e);
            NfcError::HardwareUnavailable
        })?;
        Ok(Self { ctx, poll_interval })
    }

    /// Runs until an event can no longer be delivered.
    pub fn run(self, events: Sender<HardwareEvent>) {
        info!("Starting PC/SC monitor...");

        let mut readers_buf = [0; READERS_BUF_LEN];
        let mut reader_states = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];
        let mut readers_changed = true;

        loop {
            if readers_changed {
                readers_changed = false;
                if !self.refresh_readers(&mut readers_buf, &mut reader_states, &events) {
                    break;
                }
            }

            // 1. Wait for state change
            if let Err(err) = self
                .ctx
                .get_status_change(self.poll_interval, &mut reader_states)
            {
                if err != pcsc::Error::Timeout {
                    error!("PCSC Error: {}", err);
                    thread::sleep(ERROR_BACKOFF);
                }
                continue;
            }

            // 2. PnP slot (index 0)
            if reader_states[0].event_state().intersects(State::CHANGED) {
                debug!("Reader list changed");
                readers_changed = true;
                reader_states[0].sync_current_state();
            }

            // 3. Readers (indices 1..)
            for rs in reader_states.iter_mut().skip(1) {
                if !rs.event_state().intersects(State::CHANGED) {
                    continue;
                }
                let current = rs.event_state();
                let previous = rs.current_state();
                let name = rs.name().to_string_lossy().into_owned();

                if current.intersects(State::PRESENT) && !previous.intersects(State::PRESENT) {
                    info!("Card inserted on {}", name);
                    if let Some(event) = self.tag_inserted(rs.name().to_owned(), rs.atr()) {
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }

                if current.intersects(State::EMPTY) && previous.intersects(State::PRESENT) {
                    info!("Card removed from {}", name);
                    if events.send(HardwareEvent::TagRemoved { reader: name }).is_err() {
                        return;
                    }
                }

                rs.sync_current_state();
            }
        }
        info!("PC/SC monitor stopped");
    }

    /// Diffs the reader list against the tracked states. Returns false once
    /// nobody listens anymore.
    fn refresh_readers(
        &self,
        readers_buf: &mut [u8],
        reader_states: &mut Vec<ReaderState>,
        events: &Sender<HardwareEvent>,
    ) -> bool {
        let names: Vec<CString> = match self.ctx.list_readers(readers_buf) {
            Ok(iter) => iter.map(|name| name.to_owned()).collect(),
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(err) => {
                warn!("Could not list readers: {}", err);
                Vec::new()
            }
        };

        let diff = diff_readers(reader_states.iter().skip(1).map(|rs| rs.name()), &names);
        reader_states.retain(|rs| !diff.detached.iter().any(|d| d.as_c_str() == rs.name()));
        for name in diff.detached {
            let name = name.to_string_lossy().into_owned();
            if events.send(HardwareEvent::ReaderDetached { name }).is_err() {
                return false;
            }
        }

        for name in diff.attached {
            let display = name.to_string_lossy().into_owned();
            let card = PcscCard::new(self.ctx.clone(), name.clone());
            reader_states.push(ReaderState::new(name, State::UNAWARE));
            let event = HardwareEvent::ReaderAttached {
                name: display,
                transport: Box::new(card),
            };
            if events.send(event).is_err() {
                return false;
            }
        }
        true
    }

    fn tag_inserted(&self, reader: CString, atr: &[u8]) -> Option<HardwareEvent> {
        let name = reader.to_string_lossy().into_owned();
        let mut card = PcscCard::new(self.ctx.clone(), reader);
        let uid = match apdu::get_uid(&mut card) {
            Ok(uid) => uid,
            Err(e) => {
                warn!("Could not read UID on {}: {}", name, e);
                return None;
            }
        };
        Some(HardwareEvent::TagInserted {
            reader: name,
            uid,
            atr: (!atr.is_empty()).then(|| atr.to_vec()),
        })
    }
}

/// Readers that appeared in and vanished from the latest PC/SC listing.
#[derive(Debug, Default, PartialEq)]
struct ReaderDiff {
    attached: Vec<CString>,
    detached: Vec<CString>,
}

fn diff_readers<'a>(tracked: impl IntoIterator<Item = &'a CStr>, listed: &[CString]) -> ReaderDiff {
    let tracked: Vec<&CStr> = tracked.into_iter().collect();
    let mut diff = ReaderDiff::default();
    for name in &tracked {
        if !listed.iter().any(|n| n.as_c_str() == *name) {
            diff.detached.push((*name).to_owned());
        }
    }
    for name in listed {
        if !tracked.contains(&name.as_c_str()) && !diff.attached.contains(name) {
            diff.attached.push(name.clone());
        }
    }
    diff
}
