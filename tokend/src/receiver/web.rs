// src/receiver/web.rs
// HTTP front door. Confirmation token requests arrive via our CDN, which
// stores the client's IP address in a proprietary header; we pull wallet ID
// and address out of the request and push them onto the inbox channel.

use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::METRICS;
use crate::pipeline::{ClientRequest, Item, Receiver, STAGE_CHANNEL_CAPACITY};

/// The header our CDN uses to store the client's IP address:
/// https://developer.fastly.com/reference/http/http-headers/Fastly-Client-IP/
const FASTLY_CLIENT_IP: &str = "Fastly-Client-IP";

const INDEX_PAGE: &str = "This request is handled by tokenizer.";

const ERR_BAD_WALLET_FORMAT: &str = "wallet ID has bad format";
const ERR_NO_FASTLY_HEADER: &str = "found no \"Fastly-Client-IP\" header";
const ERR_BAD_FASTLY_ADDR_FORMAT: &str = "bad IP address format in \"Fastly-Client-IP\" header";
const ERR_NO_ADDR: &str = "could not find addr in POST form data";
const ERR_BAD_ADDR_FORMAT: &str = "failed to parse given IP address";

pub struct WebReceiver {
    port: u16,
    inbox_tx: mpsc::Sender<Item>,
    inbox_rx: Option<mpsc::Receiver<Item>>,
    server: Option<axum_server::Handle>,
    worker: Option<JoinHandle<()>>,
}

impl WebReceiver {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            port: 8080,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            server: None,
            worker: None,
        }
    }
}

impl Default for WebReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Receiver for WebReceiver {
    fn set_config(&mut self, config: &Config) {
        self.port = config.port;
    }

    fn take_inbox(&mut self) -> mpsc::Receiver<Item> {
        self.inbox_rx.take().expect("inbox can only be taken once")
    }

    async fn start(&mut self) -> Result<()> {
        let app = router(self.inbox_tx.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let handle = axum_server::Handle::new();
        self.server = Some(handle.clone());

        info!("Starting Web server at {addr}.");
        self.worker = Some(tokio::spawn(async move {
            if let Err(e) = axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
            {
                error!("Web server failed: {e}");
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        info!("Stopped Web receiver.");
    }
}

pub fn router(inbox: mpsc::Sender<Item>) -> Router {
    Router::new()
        .route("/v1/confirmation/token/:wallet_id", get(conf_token_handler))
        .route("/v2/confirmation/token/:wallet_id", get(conf_token_handler))
        .route("/address", post(address_handler))
        .route("/", get(index_handler))
        .layer(middleware::from_fn(count_requests))
        .layer(Extension(inbox))
}

/// Feeds every incoming request into the rate counter.
async fn count_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    METRICS.record_request();
    next.run(req).await
}

fn reject(code: StatusCode, body: &str) -> Response {
    METRICS.count_web_response(code.as_u16(), body);
    (code, format!("{body}\n")).into_response()
}

fn accept() -> Response {
    METRICS.count_web_response(StatusCode::OK.as_u16(), "");
    StatusCode::OK.into_response()
}

/// Wallet IDs must be canonical 36-character hyphenated UUIDs. The uuid
/// crate would also accept braced and unhyphenated encodings, which our
/// clients never send.
fn parse_wallet(raw: &str) -> Option<Uuid> {
    if raw.len() != 36 {
        return None;
    }
    Uuid::parse_str(raw).ok()
}

async fn index_handler() -> String {
    format!("{INDEX_PAGE}\n")
}

async fn conf_token_handler(
    Path(raw_wallet): Path<String>,
    Extension(inbox): Extension<mpsc::Sender<Item>>,
    headers: HeaderMap,
) -> Response {
    let wallet = match parse_wallet(&raw_wallet) {
        Some(wallet) => wallet,
        None => return reject(StatusCode::BAD_REQUEST, ERR_BAD_WALLET_FORMAT),
    };

    let raw_addr = match headers.get(FASTLY_CLIENT_IP).and_then(|v| v.to_str().ok()) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return reject(StatusCode::BAD_REQUEST, ERR_NO_FASTLY_HEADER),
    };

    let addr: IpAddr = match raw_addr.parse() {
        Ok(addr) => addr,
        Err(_) => return reject(StatusCode::BAD_REQUEST, ERR_BAD_FASTLY_ADDR_FORMAT),
    };

    let response = accept();
    // The inbox is bounded, so a slow aggregator throttles us right here.
    if inbox
        .send(Item::Request(ClientRequest { addr, wallet }))
        .await
        .is_err()
    {
        warn!("Aggregator is gone; dropping request.");
        return response;
    }
    debug!("Sent received data to aggregator.");
    response
}

#[derive(Debug, Deserialize)]
struct AddressForm {
    addr: Option<String>,
}

/// Accepts a raw IP address as form data. Submissions have no wallet
/// attached, so they aggregate under the nil wallet.
async fn address_handler(
    Extension(inbox): Extension<mpsc::Sender<Item>>,
    form: Option<Form<AddressForm>>,
) -> Response {
    let raw_addr = match form.and_then(|Form(f)| f.addr) {
        Some(addr) if !addr.is_empty() => addr,
        _ => return reject(StatusCode::BAD_REQUEST, ERR_NO_ADDR),
    };

    let addr: IpAddr = match raw_addr.parse() {
        Ok(addr) => addr,
        Err(_) => return reject(StatusCode::BAD_REQUEST, ERR_BAD_ADDR_FORMAT),
    };

    let response = accept();
    if inbox
        .send(Item::Request(ClientRequest {
            addr,
            wallet: Uuid::nil(),
        }))
        .await
        .is_err()
    {
        warn!("Aggregator is gone; dropping request.");
    }
    response
}
