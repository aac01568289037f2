//! Pooled HTTP connections to the bucket endpoint.
//!
//! A connection is a permit on the pool's semaphore plus a handle on the
//! shared `reqwest` client. Holding a [`Connection`] reserves one slot; the
//! slot returns to the pool on [`Connection::release`] or drop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use url::Url;

use crate::config::{ConnectionsSection, Endpoint};
use crate::error::{Result, S3ffsError};

const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Head,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Put => reqwest::Method::PUT,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// One request against the bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Request {
    /// Object key relative to the bucket root; empty for the bucket itself.
    pub key: String,
    /// Already-encoded query string, without the leading `?`.
    pub query: Option<String>,
    pub method: Method,
    pub body: Option<Bytes>,
    /// Inclusive byte range.
    pub range: Option<(u64, u64)>,
}

impl S3Request {
    pub fn new(method: Method, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            query: None,
            method,
            body: None,
            range: None,
        }
    }

    pub fn with_query(mut self, query: String) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_range(mut self, first: u64, last: u64) -> Self {
        self.range = Some((first, last));
        self
    }
}

#[async_trait]
pub trait Connection: Send {
    /// Execute one request and return the response body. Fails with
    /// [`S3ffsError::Dispatch`] if the request could not be formed at all.
    async fn make_request(&mut self, request: S3Request) -> Result<Bytes>;

    /// Return the connection to its pool.
    fn release(self: Box<Self>) {}
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Connection>>;
}

impl Endpoint {
    /// Build the URL for `key`, addressing the bucket by path or by host.
    pub fn object_url(&self, key: &str, query: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        if !self.path_style {
            let host = url
                .host_str()
                .ok_or_else(|| S3ffsError::Dispatch(format!("endpoint {} has no host", self.base)))?;
            let vhost = format!("{}.{}", self.bucket, host);
            url.set_host(Some(&vhost))
                .map_err(|e| S3ffsError::Dispatch(format!("bad bucket host {}: {}", vhost, e)))?;
        }
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| S3ffsError::Dispatch(format!("endpoint {} cannot hold a path", self.base)))?;
            segments.pop_if_empty();
            if self.path_style {
                segments.push(&self.bucket);
            }
            segments.extend(key.split('/'));
        }
        url.set_query(query);
        Ok(url)
    }
}

pub struct ClientPool {
    name: &'static str,
    client: reqwest::Client,
    endpoint: Arc<Endpoint>,
    permits: Arc<Semaphore>,
    retries: Option<u32>,
    timeout: Duration,
}

impl ClientPool {
    pub fn new(
        name: &'static str,
        client: reqwest::Client,
        endpoint: Endpoint,
        size: usize,
        config: &ConnectionsSection,
    ) -> Self {
        Self {
            name,
            client,
            endpoint: Arc::new(endpoint),
            permits: Arc::new(Semaphore::new(size.max(1))),
            retries: config.retry_limit(),
            timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl ConnectionPool for ClientPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| S3ffsError::Dispatch(format!("pool {} is closed", self.name)))?;
        debug!(pool = self.name, "connection acquired");
        Ok(Box::new(PooledConnection {
            pool: self.name,
            client: self.client.clone(),
            endpoint: Arc::clone(&self.endpoint),
            retries: self.retries,
            timeout: self.timeout,
            _permit: permit,
        }))
    }
}

pub struct PooledConnection {
    pool: &'static str,
    client: reqwest::Client,
    endpoint: Arc<Endpoint>,
    retries: Option<u32>,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    async fn attempt(&self, url: &Url, request: &S3Request) -> Result<Bytes> {
        let mut builder = self
            .client
            .request(request.method.as_reqwest(), url.clone())
            .timeout(self.timeout);
        if let Some((first, last)) = request.range {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-{}", first, last));
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        } else if request.method == Method::Put {
            builder = builder.header(reqwest::header::CONTENT_LENGTH, 0);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(S3ffsError::Status {
                status: status.as_u16(),
                resource: url.path().to_string(),
            });
        }
        Ok(response.bytes().await?)
    }
}

fn is_retryable(err: &S3ffsError) -> bool {
    match err {
        S3ffsError::Http(_) => true,
        S3ffsError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn make_request(&mut self, request: S3Request) -> Result<Bytes> {
        let url = self
            .endpoint
            .object_url(&request.key, request.query.as_deref())?;
        debug!(pool = self.pool, method = ?request.method, %url, "http request");

        let mut attempt: u32 = 0;
        loop {
            match self.attempt(&url, &request).await {
                Ok(body) => return Ok(body),
                Err(e) if is_retryable(&e) && self.retries.map_or(true, |max| attempt < max) => {
                    attempt += 1;
                    warn!(pool = self.pool, %url, attempt, "request failed, retrying: {}", e);
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release(self: Box<Self>) {
        debug!(pool = self.pool, "connection released");
    }
}
