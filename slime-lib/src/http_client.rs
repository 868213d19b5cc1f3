use crate::{
    parse_sha256_hex, sha256_bytes, with_cancel, CasTo, GetOptions, Precondition, RangeReader,
    SlimeError, SlimeResult, Stat, Store, HEADER_CONTENT_SHA256,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, IF_MATCH, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// Total deadline for every request, bulk chunk bytes included.
pub const CHUNK_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// `If-Match` value asking for create-only semantics.
pub const IF_MATCH_NONEXISTENT: &str = "\"nonexistent\"";

pub fn new_http_client() -> SlimeResult<Client> {
    Client::builder()
        .timeout(CHUNK_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| SlimeError::Internal(format!("Failed to create http client: {}", e)))
}

fn normalize_base(base_url: &str) -> SlimeResult<Url> {
    let mut s = base_url.trim().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    Url::parse(&s).map_err(|e| SlimeError::BadArgument(format!("invalid url {}: {}", base_url, e)))
}

fn remote_err(what: &str, url: &Url, e: reqwest::Error) -> SlimeError {
    SlimeError::RemoteError(format!("{} ({}) failed: {}", what, url, e))
}

async fn fetch_text(client: &Client, url: Url, cancel: &CancellationToken) -> SlimeResult<String> {
    with_cancel(cancel, async {
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| remote_err("GET", &url, e))?;
        if resp.status() != StatusCode::OK {
            return Err(SlimeError::from_http_status(
                resp.status().as_u16(),
                url.to_string(),
            ));
        }
        resp.text().await.map_err(|e| remote_err("GET body", &url, e))
    })
    .await
}

/// Read the `/uuids` listing of a chunk-server router.
pub async fn list_store_uuids(
    client: &Client,
    base_url: &str,
    cancel: &CancellationToken,
) -> SlimeResult<Vec<Uuid>> {
    let url = normalize_base(base_url)?
        .join("uuids")
        .map_err(|e| SlimeError::BadArgument(format!("invalid url {}: {}", base_url, e)))?;
    let body = fetch_text(client, url, cancel).await?;
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            Uuid::parse_str(l)
                .map_err(|e| SlimeError::BadFormat(format!("bad uuid {:?} from {}: {}", l, base_url, e)))
        })
        .collect()
}

/// A [`Store`] backed by a remote chunk store speaking the chunk HTTP
/// protocol.
pub struct ChunkStoreClient {
    client: Client,
    base_url: Url,
    uuid: Uuid,
    name: String,
}

impl ChunkStoreClient {
    /// Connect to the store at `base_url`, learning its uuid and name.
    pub async fn connect(base_url: &str, cancel: &CancellationToken) -> SlimeResult<Self> {
        let client = new_http_client()?;
        let base_url = normalize_base(base_url)?;

        let uuid_text = fetch_text(&client, Self::mode_url(&base_url, "uuid"), cancel).await?;
        let uuid = Uuid::parse_str(uuid_text.trim()).map_err(|e| {
            SlimeError::BadFormat(format!("bad uuid {:?} from {}: {}", uuid_text, base_url, e))
        })?;
        let name = fetch_text(&client, Self::mode_url(&base_url, "name"), cancel)
            .await?
            .trim()
            .to_string();

        debug!("ChunkStoreClient: connected to {} ({}) at {}", name, uuid, base_url);
        Ok(Self {
            client,
            base_url,
            uuid,
            name,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn mode_url(base: &Url, mode: &str) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut().append_pair("mode", mode);
        url
    }

    fn key_url(&self, key: &str) -> SlimeResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SlimeError::BadArgument(format!("{} cannot hold keys", self.base_url)))?
            .pop_if_empty()
            .push(key);
        Ok(url)
    }

    fn if_match(from: &Precondition) -> Option<String> {
        match from {
            Precondition::Any => None,
            Precondition::Missing => Some(IF_MATCH_NONEXISTENT.to_string()),
            Precondition::Sha256(h) => Some(format!("\"{}\"", hex::encode(h))),
        }
    }

    fn stat_from_headers(&self, headers: &HeaderMap, body: Option<&[u8]>) -> SlimeResult<Stat> {
        let sha256 = match headers.get(HEADER_CONTENT_SHA256) {
            Some(v) => parse_sha256_hex(v.to_str().unwrap_or_default())?,
            None => match body {
                Some(b) => sha256_bytes(b),
                None => {
                    return Err(SlimeError::BadFormat(format!(
                        "{}: missing {} header",
                        self.name, HEADER_CONTENT_SHA256
                    )))
                }
            },
        };
        let size = match body {
            Some(b) => b.len() as u64,
            None => headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default(),
        };
        let write_time = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.timestamp())
            .unwrap_or_default();
        Ok(Stat {
            sha256,
            size,
            write_time,
        })
    }

    async fn fetch(
        &self,
        key: &str,
        range: Option<String>,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        let url = self.key_url(key)?;
        with_cancel(cancel, async {
            let mut req = self.client.get(url.clone());
            let partial = range.is_some();
            if let Some(r) = range {
                req = req.header(RANGE, r);
            }
            let resp = req.send().await.map_err(|e| remote_err("GET", &url, e))?;
            let status = resp.status();
            if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
                return Err(SlimeError::from_http_status(status.as_u16(), url.to_string()));
            }
            let headers = resp.headers().clone();
            let body = resp
                .bytes()
                .await
                .map_err(|e| remote_err("GET body", &url, e))?
                .to_vec();

            if partial {
                let mut stat = self.stat_from_headers(&headers, None)?;
                stat.size = match status {
                    StatusCode::PARTIAL_CONTENT => headers
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.rsplit('/').next())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(stat.size),
                    _ => body.len() as u64,
                };
                return Ok((body, stat));
            }

            let stat = self.stat_from_headers(&headers, Some(&body))?;
            if !opts.no_verify && sha256_bytes(&body) != stat.sha256 {
                warn!("ChunkStoreClient: hash mismatch for {} on {}", key, self.name);
                return Err(SlimeError::BadHash(format!("{} on {}", key, self.name)));
            }
            Ok((body, stat))
        })
        .await
    }
}

#[async_trait]
impl Store for ChunkStoreClient {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get(
        &self,
        key: &str,
        opts: GetOptions,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        self.fetch(key, None, opts, cancel).await
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> SlimeResult<Stat> {
        let url = self.key_url(key)?;
        with_cancel(cancel, async {
            let resp = self
                .client
                .head(url.clone())
                .send()
                .await
                .map_err(|e| remote_err("HEAD", &url, e))?;
            if resp.status() != StatusCode::OK {
                return Err(SlimeError::from_http_status(
                    resp.status().as_u16(),
                    url.to_string(),
                ));
            }
            self.stat_from_headers(resp.headers(), None)
        })
        .await
    }

    async fn cas(
        &self,
        key: &str,
        from: Precondition,
        to: CasTo,
        cancel: &CancellationToken,
    ) -> SlimeResult<()> {
        let url = self.key_url(key)?;
        let if_match = Self::if_match(&from);
        with_cancel(cancel, async {
            let mut req = match &to {
                CasTo::Data(data) => self
                    .client
                    .put(url.clone())
                    .header(HEADER_CONTENT_SHA256, hex::encode(sha256_bytes(data)))
                    .body(data.clone()),
                CasTo::Missing => self.client.delete(url.clone()),
            };
            if let Some(v) = if_match {
                req = req.header(IF_MATCH, v);
            }
            let resp = req.send().await.map_err(|e| remote_err("CAS", &url, e))?;
            let status = resp.status();
            if status.is_success() {
                return Ok(());
            }
            if status == StatusCode::NOT_FOUND && !to.is_present() {
                // Already gone; only a delete that named a hash has failed.
                return match from {
                    Precondition::Sha256(_) => {
                        Err(SlimeError::CasFailure(format!("{} missing on {}", key, self.name)))
                    }
                    _ => Ok(()),
                };
            }
            Err(SlimeError::from_http_status(status.as_u16(), url.to_string()))
        })
        .await
    }

    async fn list(
        &self,
        after: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> SlimeResult<Vec<String>> {
        let mut url = Self::mode_url(&self.base_url, "list");
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("after", after);
            if limit > 0 {
                q.append_pair("limit", &limit.to_string());
            }
        }
        let body = fetch_text(&self.client, url, cancel).await?;
        Ok(body
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn free_space(&self, cancel: &CancellationToken) -> SlimeResult<i64> {
        let body = fetch_text(&self.client, Self::mode_url(&self.base_url, "free"), cancel).await?;
        body.trim().parse::<i64>().map_err(|e| {
            SlimeError::BadFormat(format!("bad free space {:?} from {}: {}", body, self.name, e))
        })
    }

    fn as_range_reader(&self) -> Option<&dyn RangeReader> {
        Some(self)
    }
}

#[async_trait]
impl RangeReader for ChunkStoreClient {
    async fn get_partial(
        &self,
        key: &str,
        start: u64,
        length: i64,
        cancel: &CancellationToken,
    ) -> SlimeResult<(Vec<u8>, Stat)> {
        if length == 0 {
            let stat = self.stat(key, cancel).await?;
            return Ok((Vec::new(), stat));
        }
        let range = if length < 0 {
            format!("bytes={}-", start)
        } else {
            let last = start.checked_add(length as u64 - 1).ok_or_else(|| {
                SlimeError::BadArgument(format!(
                    "range {}+{} overflows for {}",
                    start, length, key
                ))
            })?;
            format!("bytes={}-{}", start, last)
        };
        self.fetch(key, Some(range), GetOptions::no_verify(), cancel)
            .await
    }
}
