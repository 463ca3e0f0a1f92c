// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Node-to-node RPC: transaction submission and block sync over JSON/HTTP
//! (§6 "Peer RPC"). [`GeneratorRpc`] is the seam the server side dispatches
//! through; [`PeerClient`] is the retrying client side. Neither depends on
//! the Chain Facade directly, so the facade can implement the trait without
//! this crate needing to know about it.

use async_trait::async_trait;
use chain_bounded_executor::BoundedExecutor;
use chain_failure_ext::{ChainErrorKind, Result};
use chain_logger::prelude::*;
use chain_metrics::OpMetrics;
use chain_types::{Block, Transaction};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use warp::http::{Response, StatusCode};
use warp::{Filter, Rejection, Reply};

lazy_static! {
    static ref OP_COUNTERS: OpMetrics = OpMetrics::new_and_registered("rpc");
}

const SUBMIT_PATH: &str = "rpc/generator/submit";
const GET_BLOCKS_PATH: &str = "rpc/generator/get-blocks";

/// Caps how many inbound requests this node's RPC server dispatches into
/// `GeneratorRpc` at once, so a burst of submissions cannot starve the
/// generator loop of CPU (§6, §9 "Bounded fan-out").
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// What a peer RPC server dispatches into. The Chain Facade implements
/// this; [`routes`] only knows about the trait, not the facade.
#[async_trait]
pub trait GeneratorRpc: Send + Sync {
    async fn submit_tx(&self, tx: Transaction) -> Result<()>;

    /// Blocks in ascending height, starting after `since_height` (`None`
    /// meaning "from genesis").
    async fn get_blocks(&self, since_height: Option<u64>) -> Result<Vec<Block>>;
}

/// Everything a [`PeerClient`] stamps onto outgoing requests (§6): Basic
/// auth, the `User-Agent` identity string, and the blockchain ID both
/// parties must agree on.
#[derive(Clone, Debug)]
pub struct RpcClientConfig {
    pub base_url: String,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub process_name: String,
    pub build_tag: String,
    pub blockchain_id: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl RpcClientConfig {
    fn user_agent(&self) -> String {
        format!(
            "Chain; process={}; buildtag={}; blockchainID={}",
            self.process_name, self.build_tag, self.blockchain_id
        )
    }
}

/// A bounded-retry HTTP client for one peer (§6). Every request carries a
/// fresh `Request-ID`; every response's `X-Blockchain-ID` header is
/// checked against `config.blockchain_id` before the body is trusted.
pub struct PeerClient {
    http: reqwest::Client,
    config: RpcClientConfig,
}

impl PeerClient {
    pub fn new(config: RpcClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ChainErrorKind::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(PeerClient { http, config })
    }

    /// `POST /rpc/generator/submit`: the transaction's wire bytes as the
    /// body, empty response on success (§6).
    pub async fn submit_tx(&self, tx: &Transaction) -> Result<()> {
        self.post_with_retry("submit_tx", SUBMIT_PATH, tx.to_wire_bytes()).await?;
        OP_COUNTERS.inc("submit_tx", &["ok"]);
        Ok(())
    }

    /// `POST /rpc/generator/get-blocks`: body is `since_height` as a JSON
    /// integer or `null`; response is a JSON array of hex-encoded,
    /// canonically-serialized blocks in ascending height (§6).
    pub async fn get_blocks(&self, since_height: Option<u64>) -> Result<Vec<Block>> {
        let body = serde_json::to_vec(&since_height)
            .map_err(|e| ChainErrorKind::internal(format!("failed to encode request: {}", e)))?;
        let response_bytes = self.post_with_retry("get_blocks", GET_BLOCKS_PATH, body).await?;
        let hex_blocks: Vec<String> = serde_json::from_slice(&response_bytes)
            .map_err(|e| ChainErrorKind::bad_request(format!("peer returned malformed get-blocks response: {}", e)))?;
        let mut blocks = Vec::with_capacity(hex_blocks.len());
        for encoded in hex_blocks {
            let bytes = hex::decode(&encoded)
                .map_err(|e| ChainErrorKind::bad_request(format!("peer returned non-hex block: {}", e)))?;
            blocks.push(Block::from_canonical_bytes(&bytes)?);
        }
        OP_COUNTERS.inc("get_blocks", &["ok"]);
        Ok(blocks)
    }

    async fn post_with_retry(&self, metric_name: &str, path: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.post_once(path, &body).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < self.config.max_retries && ChainErrorKind::classify(&err) == "io" => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    warn!("retrying RPC call"; "path" => path, "attempt" => attempt, "error" => %err);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    OP_COUNTERS.inc(metric_name, &["err"]);
                    return Err(err);
                }
            }
        }
    }

    async fn post_once(&self, path: &str, body: &[u8]) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Request-ID", &request_id)
            .header("User-Agent", self.config.user_agent())
            .timeout(self.config.request_timeout)
            .body(body.to_vec());
        if let Some(user) = &self.config.basic_auth_user {
            request = request.basic_auth(user, self.config.basic_auth_password.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChainErrorKind::io(format!("request to {} failed: {}", url, e)))?;

        if let Some(peer_id) = response.headers().get("X-Blockchain-ID") {
            let peer_id = peer_id.to_str().unwrap_or("");
            if peer_id != self.config.blockchain_id {
                return Err(ChainErrorKind::wrong_network(format!(
                    "peer at {} reports blockchain ID '{}', expected '{}'",
                    url, peer_id, self.config.blockchain_id
                )));
            }
        }

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChainErrorKind::io(format!("reading response from {} failed: {}", url, e)))?;
        if !status.is_success() {
            return Err(ChainErrorKind::io(format!("{} returned {}", url, status)));
        }
        Ok(bytes.to_vec())
    }
}

/// Server-side handler state shared across requests.
struct RpcState {
    handler: Arc<dyn GeneratorRpc>,
    blockchain_id: String,
    basic_auth: Option<(String, String)>,
    executor: BoundedExecutor,
}

/// Builds the warp filter serving both peer RPC endpoints (§6). `handler`
/// is typically a [`chain_facade`]-equivalent wiring of store, pool, and
/// executor; this crate has no opinion on what implements it.
pub fn routes(
    handler: Arc<dyn GeneratorRpc>,
    blockchain_id: String,
    basic_auth: Option<(String, String)>,
) -> impl Filter<Extract = (Response<Vec<u8>>,), Error = Rejection> + Clone {
    let state = Arc::new(RpcState {
        handler,
        blockchain_id,
        basic_auth,
        executor: BoundedExecutor::new(MAX_CONCURRENT_REQUESTS),
    });
    let with_state = warp::any().map(move || state.clone());

    let submit = warp::path!("rpc" / "generator" / "submit")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .and(with_state.clone())
        .and_then(handle_submit);

    let get_blocks = warp::path!("rpc" / "generator" / "get-blocks")
        .and(warp::post())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .and(with_state)
        .and_then(handle_get_blocks);

    submit.or(get_blocks).unify()
}

fn check_auth(auth_header: &Option<String>, state: &RpcState) -> std::result::Result<(), Response<Vec<u8>>> {
    let (user, password) = match &state.basic_auth {
        Some(pair) => pair,
        None => return Ok(()),
    };
    let expected = format!("Basic {}", base64_credentials(user, password));
    match auth_header {
        Some(got) if got == &expected => Ok(()),
        _ => Err(error_response(&state.blockchain_id, StatusCode::UNAUTHORIZED, "missing or invalid credentials")),
    }
}

fn base64_credentials(user: &str, password: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password))
}

async fn handle_submit(
    auth_header: Option<String>,
    body: bytes::Bytes,
    state: Arc<RpcState>,
) -> std::result::Result<Response<Vec<u8>>, Rejection> {
    if let Err(resp) = check_auth(&auth_header, &state) {
        return Ok(resp);
    }
    let tx = match Transaction::from_wire_bytes(&body) {
        Ok(tx) => tx,
        Err(e) => return Ok(error_response(&state.blockchain_id, StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let handler = state.handler.clone();
    let join = state.executor.spawn(async move { handler.submit_tx(tx).await }).await;
    match join.await {
        Ok(Ok(())) => Ok(ok_response(&state.blockchain_id, &[])),
        Ok(Err(e)) => Ok(error_response(&state.blockchain_id, status_for(&e), &e.to_string())),
        Err(e) => Ok(error_response(&state.blockchain_id, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

async fn handle_get_blocks(
    auth_header: Option<String>,
    body: bytes::Bytes,
    state: Arc<RpcState>,
) -> std::result::Result<Response<Vec<u8>>, Rejection> {
    if let Err(resp) = check_auth(&auth_header, &state) {
        return Ok(resp);
    }
    let since_height: Option<u64> = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return Ok(error_response(&state.blockchain_id, StatusCode::BAD_REQUEST, &format!("malformed request body: {}", e))),
    };
    let handler = state.handler.clone();
    let join = state.executor.spawn(async move { handler.get_blocks(since_height).await }).await;
    match join.await {
        Ok(Ok(blocks)) => {
            let hex_blocks: Vec<String> = blocks.iter().map(|b| hex::encode(b.to_canonical_bytes())).collect();
            let payload = serde_json::to_vec(&hex_blocks)
                .expect("a Vec<String> always serializes to JSON");
            Ok(ok_response(&state.blockchain_id, &payload))
        }
        Ok(Err(e)) => Ok(error_response(&state.blockchain_id, status_for(&e), &e.to_string())),
        Err(e) => Ok(error_response(&state.blockchain_id, StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

fn status_for(err: &failure::Error) -> StatusCode {
    match ChainErrorKind::classify(err) {
        "bad-request" => StatusCode::BAD_REQUEST,
        "not-found" => StatusCode::NOT_FOUND,
        "validation" => StatusCode::UNPROCESSABLE_ENTITY,
        "reserved-contention" => StatusCode::CONFLICT,
        "insufficient-funds" => StatusCode::UNPROCESSABLE_ENTITY,
        "wrong-network" => StatusCode::BAD_REQUEST,
        "io" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ok_response(blockchain_id: &str, body: &[u8]) -> Response<Vec<u8>> {
    build_response(blockchain_id, StatusCode::OK, body.to_vec())
}

#[derive(Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

fn error_response(blockchain_id: &str, status: StatusCode, message: &str) -> Response<Vec<u8>> {
    let body = serde_json::to_vec(&ErrorBody { error: message.to_string() }).unwrap_or_default();
    build_response(blockchain_id, status, body)
}

fn build_response(blockchain_id: &str, status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Blockchain-ID", blockchain_id)
        .body(body)
        .expect("a response built from static headers and a byte body never fails")
}
