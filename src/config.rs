// src/config.rs
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::geometry::{DEFAULT_TAG_TYPE, TagType};
use crate::ndef;

const MIN_APDU_TIMEOUT_MS: u64 = 1_000;
const MAX_APDU_TIMEOUT_MS: u64 = 5_000;

/// NFC tag encoding service for the card printer.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Address the HTTP/WebSocket server listens on
    #[arg(long, env = "NFC_BIND", default_value = "127.0.0.1:3500")]
    pub bind: SocketAddr,

    /// How long to wait for the reader to answer a single APDU
    #[arg(long, env = "NFC_APDU_TIMEOUT_MS", default_value_t = 3_000)]
    pub apdu_timeout_ms: u64,

    /// Language code stored in NDEF text records
    #[arg(long, env = "NFC_LANGUAGE", default_value = "fr", value_parser = parse_language)]
    pub language: String,

    /// Pages read before looking at the NDEF length
    #[arg(long, env = "NFC_READ_PAGES", default_value_t = 20)]
    pub read_pages: usize,

    /// PC/SC status polling interval
    #[arg(long, env = "NFC_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Tag family this deployment writes (NTAG213, NTAG215, NTAG216)
    #[arg(long, env = "NFC_TAG_FAMILY", default_value_t = DEFAULT_TAG_TYPE)]
    pub tag_family: TagType,

    /// Never touch PC/SC, simulate every operation
    #[arg(long, env = "NFC_SIMULATE")]
    pub simulate: bool,
}

impl Config {
    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(
            self.apdu_timeout_ms
                .clamp(MIN_APDU_TIMEOUT_MS, MAX_APDU_TIMEOUT_MS),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_language(s: &str) -> Result<String, String> {
    ndef::validate_language(s)
        .map(|()| s.to_string())
        .map_err(|e| e.to_string())
}
