// src/reader.rs
//! One worker thread per attached reader. Commands for a reader are queued
//! and executed one at a time; callers wait a bounded time for the answer.

use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, info};
use std::thread;
use std::time::Duration;

use crate::apdu::CardTransport;
use crate::error::{NfcError, Result};

struct ApduRequest {
    command: Vec<u8>,
    reply: Sender<Result<Vec<u8>>>,
}

/// Cloneable handle onto a reader's worker. Implements [`CardTransport`],
/// so page operations do not care whether they talk to hardware directly.
#[derive(Debug, Clone)]
pub struct ReaderLink {
    name: String,
    tx: Sender<ApduRequest>,
    timeout: Duration,
}

impl ReaderLink {
    /// Moves `transport` onto its own thread. The thread exits once every
    /// clone of the returned link is dropped.
    pub fn spawn(name: &str, transport: Box<dyn CardTransport>, timeout: Duration) -> Result<Self> {
        let (tx, rx) = unbounded::<ApduRequest>();
        let worker_name = name.to_string();
        thread::Builder::new()
            .name(format!("reader:{}", name))
            .spawn(move || {
                let mut transport = transport;
                for req in rx.iter() {
                    let res = transport.transmit(&req.command);
                    if req.reply.send(res).is_err() {
                        // Caller gave up waiting; the command still went out.
                        debug!("Dropped late response from {}", worker_name);
                    }
                }
                info!("Reader worker for {} stopped", worker_name);
            })
            .map_err(|e| NfcError::Transport(format!("failed to start reader worker: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            tx,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CardTransport for ReaderLink {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(ApduRequest {
                command: command.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| NfcError::Transport(format!("reader {} is gone", self.name)))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => Err(NfcError::Timeout {
                millis: self.timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(NfcError::Transport(format!(
                "reader {} stopped answering",
                self.name
            ))),
        }
    }
}
