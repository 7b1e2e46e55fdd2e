use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::constants;
use crate::group::GroupRegistry;
use crate::store::Entry;

/// Pooled client side of the peer transport. One attempt per fetch, bounded
/// by the same timeout as the upstream.
#[derive(Clone)]
pub struct PeerClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, timeout }
    }

    pub async fn fetch(&self, group: &str, key: &str, owner: &str) -> Result<Entry> {
        let uri: http::Uri = format!(
            "http://{}{}/{}/{}",
            owner,
            constants::PEER_BASE_PATH,
            group,
            urlencoding::encode(key)
        )
        .parse()
        .with_context(|| format!("peer uri for '{owner}'"))?;

        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .context("build peer request")?;

        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| anyhow!("peer {} timeout after {:?}", owner, self.timeout))?
            .with_context(|| format!("peer {owner} request"))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(anyhow!("peer {} returned {}", owner, status.as_u16()));
        }

        let expiry = resp
            .headers()
            .get(constants::PROTOCOL_EXPIRE_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_unix_millis)
            .unwrap_or_else(SystemTime::now);

        let body = resp
            .into_body()
            .collect()
            .await
            .with_context(|| format!("peer {owner} body"))?
            .to_bytes();

        Ok(Entry {
            bytes: body,
            expiry,
        })
    }
}

/// Accept loop for the peer port. MUST NOT be exposed publicly.
pub async fn serve(
    listener: TcpListener,
    registry: GroupRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept peer")?;
                let io = TokioIo::new(stream);
                let registry = registry.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let registry = registry.clone();
                        async move { Ok::<_, hyper::Error>(handle(req, registry).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("peer connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(req: Request<Incoming>, registry: GroupRegistry) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "GET only");
    }

    let path = req.uri().path();
    let (group_name, key) = match parse_path(path) {
        Some(parsed) => parsed,
        None => return text_response(StatusCode::BAD_REQUEST, "bad peer path"),
    };

    let group = match registry.lookup(&group_name) {
        Some(group) => group,
        None => return text_response(StatusCode::NOT_FOUND, "unknown group"),
    };

    // Local lookup only: the caller already decided this instance is the
    // owner, and one hop is the loop bound while rings disagree.
    match group.local_entry(&key).await {
        Ok(entry) => {
            let mut builder = Response::builder().status(StatusCode::OK).header(
                constants::PROTOCOL_EXPIRE_KEY,
                unix_millis(entry.expiry).to_string(),
            );
            builder = builder.header("content-type", "application/octet-stream");
            builder
                .body(Full::new(entry.bytes))
                .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode"))
        }
        Err(err) => {
            log::error!("peer handler: group={group_name} key='{key}' error: {err:#}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"))
        }
    }
}

fn parse_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(constants::PEER_BASE_PATH)?;
    let rest = rest.strip_prefix('/')?;
    let (group, escaped_key) = rest.split_once('/')?;
    if group.is_empty() || escaped_key.is_empty() {
        return None;
    }
    let key = urlencoding::decode(escaped_key).ok()?.into_owned();
    Some((group.to_string(), key))
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_unix_millis(raw: &str) -> Option<SystemTime> {
    let ms: u64 = raw.parse().ok()?;
    Some(UNIX_EPOCH + Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_accepts_escaped_keys() {
        let (group, key) = parse_path("/_groupcache/responses/GET%20%2Fa%2Fb%3Fq%3D1").expect("path");
        assert_eq!(group, "responses");
        assert_eq!(key, "GET /a/b?q=1");
    }

    #[test]
    fn parse_path_rejects_foreign_prefix() {
        assert!(parse_path("/other/responses/key").is_none());
        assert!(parse_path("/_groupcache/responses").is_none());
        assert!(parse_path("/_groupcache//key").is_none());
    }

    #[test]
    fn expire_header_round_trips() {
        let now = UNIX_EPOCH + Duration::from_millis(1_700_000_123_456);
        let raw = unix_millis(now).to_string();
        assert_eq!(parse_unix_millis(&raw), Some(now));
    }
}
