// src/pages.rs
//! Lays a flat NDEF buffer out over the tag's 4 byte pages, and reads it
//! back.

use log::{debug, warn};

use crate::apdu::{self, CardTransport};
use crate::error::{NfcError, Result};
use crate::geometry::{PAGE_SIZE, TagGeometry};
use crate::ndef;

/// Bytes gathered by a read, plus the error that cut it short, if any.
#[derive(Debug, Default)]
pub struct PageRead {
    pub bytes: Vec<u8>,
    pub error: Option<NfcError>,
}

pub fn pages_needed(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// Writes `buffer` from the first data page on, zero-padding the last page.
/// Not atomic: a failure leaves the earlier pages written and reports
/// where it stopped.
pub fn write_buffer(
    transport: &mut dyn CardTransport,
    geometry: &TagGeometry,
    buffer: &[u8],
) -> Result<usize> {
    if buffer.len() > geometry.max_ndef_payload_bytes {
        return Err(NfcError::CapacityExceeded {
            size: buffer.len(),
            max: geometry.max_ndef_payload_bytes,
        });
    }

    let pages = pages_needed(buffer.len());
    for (i, chunk) in buffer.chunks(PAGE_SIZE).enumerate() {
        let page = (geometry.first_data_page as usize + i) as u8;
        let mut data = [0u8; PAGE_SIZE];
        data[..chunk.len()].copy_from_slice(chunk);

        apdu::update_binary(transport, page, &data).map_err(|e| NfcError::PartialWrite {
            page,
            pages_written: i,
            source: Box::new(e),
        })?;
    }

    debug!("Wrote {} byte(s) over {} page(s)", buffer.len(), pages);
    Ok(pages)
}

/// Reads `page_count` pages one by one. Stops at the first failing page and
/// keeps what was read before it.
pub fn read_pages(transport: &mut dyn CardTransport, start_page: u8, page_count: usize) -> PageRead {
    let mut read = PageRead::default();
    for i in 0..page_count {
        let page = (start_page as usize + i) as u8;
        match apdu::read_binary(transport, page) {
            Ok(data) => read.bytes.extend_from_slice(&data),
            Err(e) => {
                warn!("Read of page {} failed: {}", page, e);
                read.error = Some(e);
                break;
            }
        }
    }
    read
}

/// Reads `initial_pages` from the first data page, then follows up with
/// as many pages as the NDEF TLV found there says it needs.
pub fn read_ndef_window(
    transport: &mut dyn CardTransport,
    geometry: &TagGeometry,
    initial_pages: usize,
) -> PageRead {
    let window = geometry.data_pages();
    let mut read = read_pages(
        transport,
        geometry.first_data_page,
        initial_pages.clamp(1, window),
    );
    if read.error.is_some() {
        return read;
    }

    if let Some((_, end)) = ndef::tlv_extent(&read.bytes) {
        let have = read.bytes.len() / PAGE_SIZE;
        let want = pages_needed(end).min(window);
        if want > have {
            let start = (geometry.first_data_page as usize + have) as u8;
            let more = read_pages(transport, start, want - have);
            read.bytes.extend(more.bytes);
            read.error = more.error;
        }
    }
    read
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::mock::{MockTag, MockTransport};
    use crate::geometry::{NTAG213, NTAG216};

    fn update_targets(commands: &[Vec<u8>]) -> Vec<u8> {
        commands
            .iter()
            .filter(|c| c[1] == 0xD6)
            .map(|c| c[3])
            .collect()
    }

    #[test]
    fn page_count_matches_buffer_length() {
        for len in 0..=40usize {
            let mut tag = MockTag::new(NTAG216.total_pages);
            let buffer: Vec<u8> = (0..len).map(|b| b as u8).collect();
            let pages = write_buffer(&mut tag, &NTAG216, &buffer).unwrap();
            assert_eq!(pages, len.div_ceil(4));

            let expected: Vec<u8> = (0..pages).map(|i| 4 + i as u8).collect();
            assert_eq!(update_targets(&tag.commands()), expected);
        }
    }

    #[test]
    fn last_page_is_zero_padded() {
        let mut tag = MockTag::new(NTAG216.total_pages);
        tag.load(5, &[0xAA; 4]);
        write_buffer(&mut tag, &NTAG216, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(tag.page(4), vec![1, 2, 3, 4]);
        assert_eq!(tag.page(5), vec![5, 0, 0, 0]);
    }

    #[test]
    fn oversized_buffer_is_rejected_before_io() {
        let mut t = MockTransport::new();
        let buffer = vec![0u8; NTAG213.max_ndef_payload_bytes + 1];
        let err = write_buffer(&mut t, &NTAG213, &buffer).unwrap_err();
        assert!(matches!(err, NfcError::CapacityExceeded { size: 145, max: 144 }));
        assert!(t.sent.is_empty());
    }

    #[test]
    fn failed_page_aborts_the_write() {
        let mut tag = MockTag::new(NTAG216.total_pages).with_failing_page(6);
        let err = write_buffer(&mut tag, &NTAG216, &[0x11; 20]).unwrap_err();
        match err {
            NfcError::PartialWrite {
                page,
                pages_written,
                source,
            } => {
                assert_eq!(page, 6);
                assert_eq!(pages_written, 2);
                assert!(source.to_string().contains("6a82"));
            }
            other => panic!("expected partial write, got {:?}", other),
        }
        // nothing was attempted after the failing page
        assert_eq!(update_targets(&tag.commands()), vec![4, 5, 6]);
        assert_eq!(tag.page(5), vec![0x11; 4]);
        assert_eq!(tag.page(7), vec![0; 4]);
    }

    #[test]
    fn read_keeps_pages_before_a_failure() {
        let mut tag = MockTag::new(NTAG216.total_pages).with_failing_page(6);
        tag.load(4, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let read = read_pages(&mut tag, 4, 5);
        assert_eq!(read.bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(read.error.is_some());
    }

    #[test]
    fn read_window_follows_long_messages() {
        let mut tag = MockTag::new(NTAG216.total_pages);
        let text = "x".repeat(200);
        let bytes = ndef::encode_text(&text, "fr").unwrap();
        write_buffer(&mut tag, &NTAG216, &bytes).unwrap();

        let read = read_ndef_window(&mut tag, &NTAG216, 20);
        assert!(read.error.is_none());
        assert_eq!(read.bytes.len(), pages_needed(bytes.len()) * 4);
        assert_eq!(&read.bytes[..bytes.len()], &bytes[..]);
    }

    #[test]
    fn read_window_stays_small_for_short_messages() {
        let mut tag = MockTag::new(NTAG216.total_pages);
        write_buffer(&mut tag, &NTAG216, &ndef::EMPTY_NDEF_MESSAGE).unwrap();
        let before = tag.commands().len();
        let read = read_ndef_window(&mut tag, &NTAG216, 20);
        assert_eq!(read.bytes.len(), 80);
        assert_eq!(tag.commands().len() - before, 20);
    }
}
