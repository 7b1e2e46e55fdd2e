use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::codec::{self, SerializedResponse};
use crate::config::Config;
use crate::group::{BoxFuture, Loader};

/// Pooled client for the upstream backend. Every request is bounded by the
/// configured backend timeout; dropping the future cancels the request.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, timeout }
    }

    pub async fn fetch(&self, method: Method, uri: Uri) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let req = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .context("build upstream request")?;
        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow!("upstream timeout after {:?}", self.timeout))?
            .context("upstream request")?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = collect_body(resp).await?;
        Ok((status, headers, body))
    }
}

async fn collect_body(resp: http::Response<Incoming>) -> Result<Bytes> {
    let body = resp.into_body().collect().await.context("read upstream body")?;
    Ok(body.to_bytes())
}

/// Turns a cache key into a serialized upstream response. Transport errors
/// propagate and are never cached; HTTP error statuses become entries under
/// the shorter error TTL.
#[derive(Clone)]
pub struct UpstreamLoader {
    client: UpstreamClient,
    backend: Uri,
    cache_ttl: Duration,
    cache_error_ttl: Duration,
}

impl UpstreamLoader {
    pub fn new(cfg: &Config) -> Result<Self> {
        let backend: Uri = cfg
            .backend_url
            .parse()
            .with_context(|| format!("backend_url: '{}'", cfg.backend_url))?;
        Ok(Self {
            client: UpstreamClient::new(cfg.backend_timeout),
            backend,
            cache_ttl: cfg.cache_ttl,
            cache_error_ttl: cfg.cache_error_ttl,
        })
    }

    pub async fn fetch_serialized(&self, key: &str) -> Result<(Bytes, SystemTime)> {
        let (method, uri) = parse_key(key)?;
        let target = join_backend(&self.backend, &uri)?;

        let begin = Instant::now();
        let (status, headers, body) = self.client.fetch(method.clone(), target.clone()).await?;
        let elapsed = begin.elapsed();

        let error_status = is_http_error(status);
        if error_status {
            log::error!(
                "loader: method={} url={} response_status={} elapsed={:?}",
                method,
                target,
                status.as_u16(),
                elapsed
            );
        } else {
            log::debug!(
                "loader: method={} url={} response_status={} elapsed={:?}",
                method,
                target,
                status.as_u16(),
                elapsed
            );
        }

        let resp = SerializedResponse::from_parts(status, &headers, body);
        let data = codec::encode(&resp)?;

        let ttl = if error_status {
            self.cache_error_ttl
        } else {
            self.cache_ttl
        };
        Ok((data, SystemTime::now() + ttl))
    }
}

impl Loader for UpstreamLoader {
    fn load(&self, key: &str) -> BoxFuture<Result<(Bytes, SystemTime)>> {
        let this = self.clone();
        let key = key.to_string();
        Box::pin(async move { this.fetch_serialized(&key).await })
    }
}

pub fn is_http_error(status: StatusCode) -> bool {
    let code = status.as_u16();
    code < 200 || code >= 300
}

/// Split a cache key back into method and request URI. Malformed keys are
/// rejected and never reach the store.
fn parse_key(key: &str) -> Result<(Method, String)> {
    let (method, uri) = key
        .split_once(' ')
        .ok_or_else(|| anyhow!("loader: bad key: '{key}'"))?;
    let method =
        Method::from_bytes(method.as_bytes()).with_context(|| format!("loader: bad method in key: '{key}'"))?;
    if uri.is_empty() {
        return Err(anyhow!("loader: bad key: '{key}'"));
    }
    Ok((method, uri.to_string()))
}

fn join_backend(backend: &Uri, uri: &str) -> Result<Uri> {
    let scheme = backend.scheme_str().unwrap_or("http");
    let authority = backend
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| anyhow!("backend URL has no host"))?;
    let path = if uri.starts_with('/') {
        uri.to_string()
    } else {
        format!("/{uri}")
    };
    format!("{scheme}://{authority}{path}")
        .parse()
        .with_context(|| format!("join backend URL: '{uri}'"))
}
