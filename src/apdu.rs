// src/apdu.rs
use log::{debug, trace, warn};
use pcsc::{Card, Context, Protocols, ShareMode};
use std::ffi::CString;

use crate::error::{NfcError, Result};
use crate::geometry::PAGE_SIZE;

pub const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Anything that can carry one command to a tag and bring back the raw
/// response, status word included.
pub trait CardTransport: Send {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

// Read: FF B0 00 Page Len
pub fn read_binary_command(page: u8) -> [u8; 5] {
    [0xFF, 0xB0, 0x00, page, PAGE_SIZE as u8]
}

// Write: FF D6 00 Page Len [Data]
pub fn update_binary_command(page: u8, data: &[u8; PAGE_SIZE]) -> [u8; 9] {
    [
        0xFF,
        0xD6,
        0x00,
        page,
        PAGE_SIZE as u8,
        data[0],
        data[1],
        data[2],
        data[3],
    ]
}

// GET DATA (UID): FF CA 00 00 00
pub const GET_UID_COMMAND: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Splits off the status word. Anything but 90 00 is an error.
pub fn check_status(resp: &[u8]) -> Result<Vec<u8>> {
    if resp.len() < 2 {
        return Err(NfcError::MalformedResponse { len: resp.len() });
    }
    let (data, sw) = resp.split_at(resp.len() - 2);
    if sw != SW_SUCCESS {
        return Err(NfcError::Apdu {
            status: hex::encode(sw),
        });
    }
    Ok(data.to_vec())
}

pub fn read_binary(transport: &mut dyn CardTransport, page: u8) -> Result<Vec<u8>> {
    let resp = transport.transmit(&read_binary_command(page))?;
    let mut data = check_status(&resp)?;
    // Some readers answer with 16 bytes (four pages) to a 4 byte read
    data.truncate(PAGE_SIZE);
    trace!("READ page {} -> {}", page, hex::encode(&data));
    Ok(data)
}

pub fn update_binary(
    transport: &mut dyn CardTransport,
    page: u8,
    data: &[u8; PAGE_SIZE],
) -> Result<()> {
    trace!("WRITE page {} <- {}", page, hex::encode(data));
    let resp = transport.transmit(&update_binary_command(page, data))?;
    check_status(&resp).map(|_| ())
}

pub fn get_uid(transport: &mut dyn CardTransport) -> Result<Vec<u8>> {
    let resp = transport.transmit(&GET_UID_COMMAND)?;
    check_status(&resp)
}

/// PC/SC card behind a named reader. Connects lazily and reconnects once
/// when the reader reports that the card was reset or swapped.
pub struct PcscCard {
    ctx: Context,
    reader: CString,
    card: Option<Card>,
}

impl PcscCard {
    pub fn new(ctx: Context, reader: CString) -> Self {
        Self {
            ctx,
            reader,
            card: None,
        }
    }

    fn connect(&mut self) -> std::result::Result<&Card, pcsc::Error> {
        let card = match self.card.take() {
            Some(card) => card,
            None => {
                debug!("Connecting to card on {:?}", self.reader);
                self.ctx
                    .connect(&self.reader, ShareMode::Shared, Protocols::ANY)?
            }
        };
        Ok(self.card.insert(card))
    }

    fn transmit_once(&mut self, command: &[u8]) -> std::result::Result<Vec<u8>, pcsc::Error> {
        let card = self.connect()?;
        let mut recv_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        card.transmit(command, &mut recv_buffer).map(|r| r.to_vec())
    }
}

impl CardTransport for PcscCard {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        match self.transmit_once(command) {
            Ok(resp) => Ok(resp),
            Err(pcsc::Error::ResetCard) | Err(pcsc::Error::RemovedCard) => {
                // Stale handle from a previous tag; nothing reached the new one yet.
                warn!("Card handle on {:?} is stale, reconnecting", self.reader);
                self.card = None;
                self.transmit_once(command).map_err(|e| {
                    self.card = None;
                    NfcError::from(e)
                })
            }
            Err(e) => {
                self.card = None;
                Err(e.into())
            }
        }
    }
}
