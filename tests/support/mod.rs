use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use cachemesh::config::Config;
use cachemesh::server::App;

/// Config for one in-process instance. `base` spreads the four listeners over
/// base..base+3 so instances in the same test binary do not collide.
pub fn test_config(base: u16, backend_url: &str) -> Config {
    Config {
        listen_addr: format!("127.0.0.1:{base}"),
        backend_url: backend_url.to_string(),
        backend_timeout: Duration::from_secs(5),
        cache_ttl: Duration::from_secs(60),
        cache_error_ttl: Duration::from_secs(60),
        groupcache_port: base + 1,
        advertise_ip: "127.0.0.1".to_string(),
        health_addr: format!("127.0.0.1:{}", base + 2),
        metrics_addr: format!("127.0.0.1:{}", base + 3),
        discovery_interval: Duration::from_millis(500),
        purge_expired: false,
        ..Config::default()
    }
}

/// Bind and run an instance in the background. The shutdown sender is leaked
/// so the instance lives for the whole test binary.
pub async fn spawn_app(cfg: Config) -> SocketAddr {
    let app = App::bind(Arc::new(cfg)).await.expect("bind app");
    let proxy_addr = app.proxy_addr().expect("proxy addr");
    let (tx, rx) = tokio::sync::watch::channel(false);
    std::mem::forget(tx);
    tokio::spawn(async move {
        let _ = app.run(rx).await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    proxy_addr
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(addr: SocketAddr, method: Method, path: &str) -> TestResponse {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect proxy");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, addr.to_string())
        .body(Full::new(Bytes::new()))
        .expect("request");

    let resp = sender.send_request(req).await.expect("send request");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.expect("body").to_bytes();

    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> TestResponse {
    send(addr, Method::GET, path).await
}

pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        Self::serve(listener, handler).await
    }

    pub async fn start_on<F>(addr: SocketAddr, handler: F) -> Self
    where
        F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(addr).await.expect("bind mock");
        Self::serve(listener, handler).await
    }

    async fn serve<F>(listener: TcpListener, handler: F) -> Self
    where
        F: Fn(&Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let hits = Arc::clone(&hits_inner);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                hits.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(&req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("response")
}
