// src/server.rs
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::error::{NfcError, Result};
use crate::nfc_service::NfcService;
use crate::types::{
    ApiResponse, ErrorResponse, IncomingMessage, OutgoingMessage, ReaderRequest, WriteRequest,
};

const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug)]
struct InvalidBody(String);

impl warp::reject::Reject for InvalidBody {}

#[derive(Debug)]
struct BodyTooLarge;

impl warp::reject::Reject for BodyTooLarge {}

/// Serves the HTTP API and the event WebSocket until `shutdown` resolves.
pub async fn start_server(
    service: Arc<NfcService>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let routes = routes(service).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["content-type"]),
    );

    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| NfcError::Transport(format!("cannot listen on {}: {}", addr, e)))?;
    info!("NFC service listening on http://{} (events on ws://{}/ws)", bound, bound);
    server.await;
    Ok(())
}

pub fn routes(
    service: Arc<NfcService>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let status = warp::path!("api" / "nfc" / "status")
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: Arc<NfcService>| warp::reply::json(&ApiResponse::ok(service.status())));

    let readers = warp::path!("api" / "nfc" / "readers")
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: Arc<NfcService>| {
            warp::reply::json(&ApiResponse::ok(service.list_readers()))
        });

    let info = warp::path!("api" / "nfc" / "info")
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: Arc<NfcService>| {
            warp::reply::json(&ApiResponse::ok(service.tag_type_info()))
        });

    let supported_types = warp::path!("api" / "nfc" / "supported-types")
        .and(warp::get())
        .and(with_service(service.clone()))
        .map(|service: Arc<NfcService>| {
            warp::reply::json(&ApiResponse::ok(service.supported_types()))
        });

    let read = warp::path!("api" / "nfc" / "read")
        .and(warp::post())
        .and(lenient_json::<ReaderRequest>())
        .and(with_service(service.clone()))
        .and_then(read_tag);

    let write = warp::path!("api" / "nfc" / "write")
        .and(warp::post())
        .and(lenient_json::<WriteRequest>())
        .and(with_service(service.clone()))
        .and_then(write_tag);

    let format = warp::path!("api" / "nfc" / "format")
        .and(warp::post())
        .and(lenient_json::<ReaderRequest>())
        .and(with_service(service.clone()))
        .and_then(format_tag);

    let ws = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_service(service))
        .map(|ws: Ws, service: Arc<NfcService>| {
            ws.on_upgrade(move |socket| handle_connection(socket, service))
        });

    status
        .or(readers)
        .or(info)
        .or(supported_types)
        .or(read)
        .or(write)
        .or(format)
        .or(ws)
        .recover(handle_rejection)
}

fn with_service(
    service: Arc<NfcService>,
) -> impl Filter<Extract = (Arc<NfcService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// JSON body where a missing or empty body means "all defaults". The
/// length header is optional, so bodyless POSTs from curl or fetch work.
fn lenient_json<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: DeserializeOwned + Default + Send + 'static,
{
    warp::header::optional::<u64>("content-length")
        .and_then(|len: Option<u64>| async move {
            match len {
                Some(len) if len > MAX_BODY_BYTES => Err(warp::reject::custom(BodyTooLarge)),
                _ => Ok(()),
            }
        })
        .untuple_one()
        .and(warp::body::bytes())
        .and_then(|body: Bytes| async move {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(T::default());
            }
            serde_json::from_slice(&body)
                .map_err(|e| warp::reject::custom(InvalidBody(e.to_string())))
        })
}

async fn read_tag(
    request: ReaderRequest,
    service: Arc<NfcService>,
) -> std::result::Result<impl Reply, Rejection> {
    let result = service.read_tag(request.reader.as_deref()).await;
    Ok(warp::reply::json(&result))
}

async fn write_tag(
    request: WriteRequest,
    service: Arc<NfcService>,
) -> std::result::Result<warp::reply::Response, Rejection> {
    let data = match request.data {
        None | Some(Value::Null) => {
            return Ok(warp::reply::with_status(
                warp::reply::json(&ErrorResponse::new("data to write is required")),
                StatusCode::BAD_REQUEST,
            )
            .into_response());
        }
        Some(data) => data,
    };
    let result = service.write_tag(&data, request.reader.as_deref()).await;
    Ok(warp::reply::json(&result).into_response())
}

async fn format_tag(
    request: ReaderRequest,
    service: Arc<NfcService>,
) -> std::result::Result<impl Reply, Rejection> {
    let result = service.format_tag(request.reader.as_deref()).await;
    Ok(warp::reply::json(&result))
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(InvalidBody(msg)) = err.find() {
        (StatusCode::BAD_REQUEST, format!("invalid JSON body: {}", msg))
    } else if err.find::<BodyTooLarge>().is_some()
        || err.find::<warp::reject::PayloadTooLarge>().is_some()
    {
        (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "content-length required".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorResponse::new(message)),
        code,
    ))
}

async fn handle_connection(ws: WebSocket, service: Arc<NfcService>) {
    let (mut client_ws_tx, mut client_ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutgoingMessage>();
    let mut events = service.subscribe();

    // Only this task writes to the socket
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Could not serialize event: {}", e);
                    continue;
                }
            };
            if client_ws_tx.send(Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    // Broadcast events -> client
    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(msg) => {
                    if forward_tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client fell behind, {} event(s) dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let _ = tx.send(OutgoingMessage::Status {
        status: service.status(),
    });

    // Handle incoming messages from client
    while let Some(result) = client_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("WebSocket receive error: {}", e);
                break;
            }
        };
        let Ok(text) = msg.to_str() else {
            continue;
        };
        match serde_json::from_str::<IncomingMessage>(text) {
            Ok(IncomingMessage::GetStatus) => {
                let _ = tx.send(OutgoingMessage::Status {
                    status: service.status(),
                });
            }
            Err(e) => debug!("Ignoring WebSocket message {:?}: {}", text, e),
        }
    }

    forwarder.abort();
    writer.abort();
    debug!("WebSocket client disconnected");
}
