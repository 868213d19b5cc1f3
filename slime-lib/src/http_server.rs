//! Chunk-server router.
//!
//! Serves any number of [`Store`]s behind one base URL:
//!
//! ```text
//! GET  /                     greeting
//! GET  /uuids                newline separated store uuids
//! GET  /{uuid}/?mode=...     uuid | name | free | list (after, limit)
//! *    /{uuid}/{key}         GET HEAD PUT DELETE on one key
//! ```
//!
//! The key level follows the chunk HTTP protocol that
//! [`crate::ChunkStoreClient`] speaks: `X-Content-SHA256` on every response
//! carrying content, `If-Match` for compare-and-swap, `Range` on reads.

use crate::{
    parse_sha256_hex, sha256_bytes, CasTo, GetOptions, Precondition, SlimeError, SlimeResult,
    Stat, StoreRef, HEADER_CONTENT_SHA256,
};
use chrono::{TimeZone, Utc};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::http::header::{self, HeaderName, HeaderValue};
use warp::http::{HeaderMap, Method, StatusCode};
use warp::hyper::body::{Body, Bytes};
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection};

pub const MAX_PUT_SIZE: usize = 64 * 1024 * 1024;

const GREETING: &str = "slime chunk server\n";
const DELETE_ATTEMPTS: usize = 10;

pub struct StoreRouter {
    stores: Vec<StoreRef>,
    max_put_size: u64,
    cancel: CancellationToken,
}

impl StoreRouter {
    pub fn new(stores: Vec<StoreRef>) -> Arc<Self> {
        Self::with_max_put_size(stores, MAX_PUT_SIZE as u64)
    }

    /// PUT bodies above `max_put_size` bytes are refused with 413 before
    /// any of them is read.
    pub fn with_max_put_size(stores: Vec<StoreRef>, max_put_size: u64) -> Arc<Self> {
        Arc::new(Self {
            stores,
            max_put_size,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancels every request still running against the stores.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn filter(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone + Send + Sync + 'static {
        // PUT needs a Content-Length within the limit; every other method
        // is handled without reading a body.
        let put_body = warp::put()
            .map(|| Method::PUT)
            .and(warp::body::content_length_limit(self.max_put_size))
            .and(warp::body::bytes());
        let no_body = warp::method()
            .and_then(|method: Method| async move {
                if method == Method::PUT {
                    Err(warp::reject::not_found())
                } else {
                    Ok::<_, Rejection>((method, Bytes::new()))
                }
            })
            .untuple_one();

        put_body
            .or(no_body)
            .unify()
            .and(warp::path::full())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::headers_cloned())
            .and_then(
                move |method: Method,
                      body: Bytes,
                      path: FullPath,
                      query: HashMap<String, String>,
                      headers: HeaderMap| {
                    let router = self.clone();
                    async move {
                        Ok::<_, Rejection>(router.handle(method, path, query, headers, body).await)
                    }
                },
            )
    }

    async fn handle(
        &self,
        method: Method,
        path: FullPath,
        query: HashMap<String, String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let segments: Vec<String> = path
            .as_str()
            .trim_start_matches('/')
            .split('/')
            .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
            .collect();
        let cancel = self.cancel.child_token();

        let result = match segments.as_slice() {
            [root] if root.is_empty() => Ok(text_reply(StatusCode::OK, GREETING.to_string())),
            [uuids] if uuids == "uuids" => {
                let body: String = self
                    .stores
                    .iter()
                    .map(|s| format!("{}\n", s.uuid()))
                    .collect();
                Ok(text_reply(StatusCode::OK, body))
            }
            [id] => self.handle_store(id, &query, &cancel).await,
            [id, key] if key.is_empty() => self.handle_store(id, &query, &cancel).await,
            [id, key] => match self.store_by_id(id) {
                Some(store) => {
                    handle_key(&store, key, &method, &headers, body, &cancel).await
                }
                None => Ok(status_reply(StatusCode::NOT_FOUND)),
            },
            _ => Ok(status_reply(StatusCode::NOT_FOUND)),
        };

        result.unwrap_or_else(|e| {
            debug!("StoreRouter: {} {} failed: {}", method, path.as_str(), e);
            text_reply(status_for(&e), e.to_string())
        })
    }

    fn store_by_id(&self, id: &str) -> Option<StoreRef> {
        let uuid = Uuid::parse_str(id).ok()?;
        self.stores.iter().find(|s| s.uuid() == uuid).cloned()
    }

    async fn handle_store(
        &self,
        id: &str,
        query: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> SlimeResult<Response> {
        let store = match self.store_by_id(id) {
            Some(s) => s,
            None => return Ok(status_reply(StatusCode::NOT_FOUND)),
        };
        match query.get("mode").map(String::as_str) {
            Some("uuid") => Ok(text_reply(StatusCode::OK, store.uuid().to_string())),
            Some("name") => Ok(text_reply(StatusCode::OK, store.name())),
            Some("free") => {
                let free = store.free_space(cancel).await?;
                Ok(text_reply(StatusCode::OK, free.to_string()))
            }
            Some("list") => {
                let after = query.get("after").map(String::as_str).unwrap_or("");
                let limit = match query.get("limit") {
                    Some(l) => l
                        .parse::<usize>()
                        .map_err(|e| SlimeError::BadArgument(format!("bad limit {:?}: {}", l, e)))?,
                    None => 0,
                };
                let keys = store.list(after, limit, cancel).await?;
                let body: String = keys.iter().map(|k| format!("{}\n", k)).collect();
                Ok(text_reply(StatusCode::OK, body))
            }
            _ => Ok(text_reply(StatusCode::OK, GREETING.to_string())),
        }
    }
}

async fn handle_key(
    store: &StoreRef,
    key: &str,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    cancel: &CancellationToken,
) -> SlimeResult<Response> {
    match *method {
        Method::GET => {
            let (data, stat) = store.get(key, GetOptions::default(), cancel).await?;
            if not_modified(headers, &stat) {
                let mut resp = status_reply(StatusCode::NOT_MODIFIED);
                stat_headers(&mut resp, &stat);
                return Ok(resp);
            }
            match header_str(headers, &header::RANGE) {
                Some(range) => ranged_reply(data, &stat, range),
                None => {
                    let mut resp = bytes_reply(StatusCode::OK, data);
                    stat_headers(&mut resp, &stat);
                    Ok(resp)
                }
            }
        }
        Method::HEAD => {
            let stat = store.stat(key, cancel).await?;
            let mut resp = status_reply(StatusCode::OK);
            stat_headers(&mut resp, &stat);
            set_header(&mut resp, header::CONTENT_LENGTH, &stat.size.to_string());
            Ok(resp)
        }
        Method::PUT => {
            if let Some(want) = header_str(headers, &HeaderName::from_static(HEADER_CONTENT_SHA256)) {
                if parse_sha256_hex(want)? != sha256_bytes(&body) {
                    return Err(SlimeError::BadArgument(format!(
                        "{}: content does not match {}",
                        key, HEADER_CONTENT_SHA256
                    )));
                }
            }
            let from = parse_if_match(headers)?.unwrap_or(Precondition::Any);
            store.cas(key, from, CasTo::Data(body.to_vec()), cancel).await?;
            Ok(status_reply(StatusCode::NO_CONTENT))
        }
        Method::DELETE => {
            match parse_if_match(headers)? {
                Some(from) => {
                    if let Precondition::Sha256(_) = from {
                        // Report a missing key as 404 rather than a failed precondition.
                        store.stat(key, cancel).await?;
                    }
                    store.cas(key, from, CasTo::Missing, cancel).await?;
                }
                None => delete_current(store, key, cancel).await?,
            }
            Ok(status_reply(StatusCode::NO_CONTENT))
        }
        _ => Ok(status_reply(StatusCode::METHOD_NOT_ALLOWED)),
    }
}

/// Unconditional delete expressed as stat-then-CAS so that concurrent
/// writers are never clobbered blindly.
async fn delete_current(store: &StoreRef, key: &str, cancel: &CancellationToken) -> SlimeResult<()> {
    for _ in 0..DELETE_ATTEMPTS {
        let stat = store.stat(key, cancel).await?;
        match store
            .cas(key, Precondition::Sha256(stat.sha256), CasTo::Missing, cancel)
            .await
        {
            Err(SlimeError::CasFailure(_)) => continue,
            other => return other,
        }
    }
    Err(SlimeError::TooManyRetries(format!("delete {}", key)))
}

fn parse_if_match(headers: &HeaderMap) -> SlimeResult<Option<Precondition>> {
    let value = match header_str(headers, &header::IF_MATCH) {
        Some(v) => v.trim(),
        None => return Ok(None),
    };
    let unquoted = value.trim_matches('"');
    if unquoted == "nonexistent" {
        return Ok(Some(Precondition::Missing));
    }
    if unquoted == "*" {
        return Ok(Some(Precondition::Any));
    }
    parse_sha256_hex(unquoted)
        .map(|h| Some(Precondition::Sha256(h)))
        .map_err(|_| SlimeError::BadArgument(format!("bad If-Match {:?}", value)))
}

fn not_modified(headers: &HeaderMap, stat: &Stat) -> bool {
    let value = match header_str(headers, &header::IF_NONE_MATCH) {
        Some(v) => v,
        None => return false,
    };
    let etag = hex::encode(stat.sha256);
    value.split(',').map(str::trim).any(|tag| {
        tag == "*" || tag.trim_start_matches("W/").trim_matches('"') == etag
    })
}

fn ranged_reply(data: Vec<u8>, stat: &Stat, range: &str) -> SlimeResult<Response> {
    let size = data.len() as u64;
    let spec = range
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| SlimeError::BadArgument(format!("bad range {:?}", range)))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| SlimeError::BadArgument(format!("bad range {:?}", range)))?;
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| SlimeError::BadArgument(format!("bad range {:?}", range)))?;
    let end: u64 = match end.trim() {
        "" => size.saturating_sub(1),
        e => e
            .parse::<u64>()
            .map_err(|_| SlimeError::BadArgument(format!("bad range {:?}", range)))?
            .min(size.saturating_sub(1)),
    };

    if start >= size || end < start {
        let mut resp = status_reply(StatusCode::RANGE_NOT_SATISFIABLE);
        set_header(&mut resp, header::CONTENT_RANGE, &format!("bytes */{}", size));
        return Ok(resp);
    }

    let part = data[start as usize..=end as usize].to_vec();
    let mut resp = bytes_reply(StatusCode::PARTIAL_CONTENT, part);
    stat_headers(&mut resp, stat);
    set_header(
        &mut resp,
        header::CONTENT_RANGE,
        &format!("bytes {}-{}/{}", start, end, size),
    );
    Ok(resp)
}

fn status_for(err: &SlimeError) -> StatusCode {
    match err {
        SlimeError::NotFound(_) => StatusCode::NOT_FOUND,
        SlimeError::CasFailure(_) => StatusCode::PRECONDITION_FAILED,
        SlimeError::BadArgument(_) | SlimeError::BadFormat(_) => StatusCode::BAD_REQUEST,
        SlimeError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn set_header(resp: &mut Response, name: HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        resp.headers_mut().insert(name, v);
    }
}

fn stat_headers(resp: &mut Response, stat: &Stat) {
    let sum = hex::encode(stat.sha256);
    set_header(resp, HeaderName::from_static(HEADER_CONTENT_SHA256), &sum);
    set_header(resp, header::ETAG, &format!("\"{}\"", sum));
    if let Some(t) = Utc.timestamp_opt(stat.write_time, 0).single() {
        set_header(
            resp,
            header::LAST_MODIFIED,
            &t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
    }
}

fn bytes_reply(status: StatusCode, data: Vec<u8>) -> Response {
    let mut resp = Response::new(Body::from(data));
    *resp.status_mut() = status;
    resp
}

fn text_reply(status: StatusCode, text: String) -> Response {
    bytes_reply(status, text.into_bytes())
}

fn status_reply(status: StatusCode) -> Response {
    bytes_reply(status, Vec::new())
}

/// Serve `stores` on an ephemeral localhost port until the returned task is
/// aborted.
pub async fn serve_stores(stores: Vec<StoreRef>) -> SlimeResult<(SocketAddr, JoinHandle<()>)> {
    let router = StoreRouter::new(stores);
    let (addr, server) = warp::serve(router.filter())
        .try_bind_ephemeral(([127, 0, 0, 1], 0))
        .map_err(|e| SlimeError::IoError(format!("bind chunk server failed: {}", e)))?;
    info!("StoreRouter: serving on {}", addr);
    Ok((addr, tokio::spawn(server)))
}

/// Serve `stores` on `addr` until `cancel` fires.
pub async fn serve_stores_until(
    addr: SocketAddr,
    stores: Vec<StoreRef>,
    cancel: CancellationToken,
) -> SlimeResult<SocketAddr> {
    let router = StoreRouter::new(stores);
    let stop = router.clone();
    let shutdown = async move {
        cancel.cancelled().await;
        stop.shutdown();
    };
    let (bound, server) = warp::serve(router.filter())
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| SlimeError::IoError(format!("bind chunk server on {} failed: {}", addr, e)))?;
    info!("StoreRouter: serving on {}", bound);
    server.await;
    Ok(bound)
}
