//! Whole-object requests: each call brackets one pooled connection.

use bytes::Bytes;
use tracing::{debug, info};

use super::pool::{ConnectionPool, Method, S3Request};
use crate::error::Result;

/// Fetch `len` bytes of `key` starting at `offset`.
pub async fn get_range(pool: &dyn ConnectionPool, key: &str, offset: u64, len: u64) -> Result<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut conn = pool.acquire().await?;
    let request = S3Request::new(Method::Get, key).with_range(offset, offset + len - 1);
    let result = conn.make_request(request).await;
    conn.release();
    let body = result?;
    debug!(key, offset, len, got = body.len(), "object range fetched");
    Ok(body)
}

/// Upload `body` as the full contents of `key`.
pub async fn put_object(pool: &dyn ConnectionPool, key: &str, body: Bytes) -> Result<()> {
    let size = body.len();
    let mut conn = pool.acquire().await?;
    let result = conn
        .make_request(S3Request::new(Method::Put, key).with_body(body))
        .await;
    conn.release();
    result?;
    debug!(key, size, "object uploaded");
    Ok(())
}

/// Check that the bucket answers before mounting it.
pub async fn check_bucket(pool: &dyn ConnectionPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    let result = conn.make_request(S3Request::new(Method::Head, "")).await;
    conn.release();
    result?;
    info!("bucket is reachable");
    Ok(())
}
