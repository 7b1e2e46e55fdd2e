use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::admission::Admission;
use crate::codec::{self, SerializedResponse};
use crate::config::Config;
use crate::constants;
use crate::discovery::{Discovery, StaticPeerSource};
use crate::group::{Group, GroupRegistry, Loader};
use crate::loader::{is_http_error, UpstreamLoader};
use crate::metrics;
use crate::peer::{self, PeerClient};
use crate::ring::Ring;
use crate::store::Store;

pub async fn run(cfg: Arc<Config>) -> Result<()> {
    let app = App::bind(cfg).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    app.run(shutdown_rx).await
}

struct AppState {
    admission: Admission,
    group: Arc<Group>,
    loader: UpstreamLoader,
    store: Arc<Store>,
    metrics_path: String,
    health_path: String,
}

/// A fully bound instance: all four listeners are open but not yet serving.
/// Tests use `bind` + `run` directly to drive several instances in-process.
pub struct App {
    cfg: Arc<Config>,
    state: Arc<AppState>,
    registry: GroupRegistry,
    discovery: Discovery,
    proxy_listener: TcpListener,
    peer_listener: TcpListener,
    health_listener: TcpListener,
    metrics_listener: TcpListener,
}

impl App {
    pub async fn bind(cfg: Arc<Config>) -> Result<App> {
        let peer_listener = bind_listener(&format!(":{}", cfg.groupcache_port))?;
        let self_addr = cfg.advertise_addr();
        log::info!("groupcache address: {self_addr}");

        let ring = Arc::new(Ring::new(self_addr.clone()));
        let store = Arc::new(Store::new(cfg.groupcache_size_bytes));
        let loader = UpstreamLoader::new(&cfg)?;
        let group = Group::new(
            constants::DEFAULT_GROUP,
            self_addr.clone(),
            Arc::clone(&ring),
            Arc::clone(&store),
            PeerClient::new(cfg.backend_timeout),
            Arc::new(loader.clone()) as Arc<dyn Loader>,
        );
        let registry = GroupRegistry::new();
        registry.register(Arc::clone(&group));

        let discovery = Discovery::new(
            ring,
            Arc::new(StaticPeerSource::new(cfg.peers.clone())),
            self_addr,
            cfg.discovery_interval,
            cfg.force_single_task,
        );

        let admission = Admission::new(&cfg.restrict_method, &cfg.restrict_route_regexp)?;

        let state = Arc::new(AppState {
            admission,
            group,
            loader,
            store,
            metrics_path: cfg.metrics_path.clone(),
            health_path: cfg.health_path.clone(),
        });

        Ok(App {
            state,
            registry,
            discovery,
            proxy_listener: bind_listener(&cfg.listen_addr)?,
            peer_listener,
            health_listener: bind_listener(&cfg.health_addr)?,
            metrics_listener: bind_listener(&cfg.metrics_addr)?,
            cfg,
        })
    }

    pub fn proxy_addr(&self) -> Result<SocketAddr> {
        self.proxy_listener.local_addr().context("proxy local addr")
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.peer_listener.local_addr().context("peer local addr")
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let App {
            cfg,
            state,
            registry,
            discovery,
            proxy_listener,
            peer_listener,
            health_listener,
            metrics_listener,
        } = self;

        tokio::spawn(discovery.run(shutdown.clone()));

        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = peer::serve(peer_listener, registry, shutdown).await {
                    log::error!("peer server exited: {err:#}");
                }
            });
        }

        tokio::spawn(run_health(
            health_listener,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        tokio::spawn(run_metrics(
            metrics_listener,
            Arc::clone(&state),
            shutdown.clone(),
        ));

        if cfg.purge_expired {
            tokio::spawn(run_sweeper(
                Arc::clone(&state.store),
                cfg.purge_interval,
                shutdown.clone(),
            ));
        }

        log::info!("application server: listening on {}", cfg.listen_addr);
        let result = run_proxy(proxy_listener, shutdown.clone(), state).await;

        if *shutdown.borrow() {
            // drain window for spawned request handlers
            tokio::time::sleep(cfg.shutdown_grace).await;
        }
        result
    }
}

async fn run_proxy(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let begin = Instant::now();
    let request_id = metrics::request_id_from_headers(req.headers());
    let method = req.method().as_str().to_uppercase();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let use_cache = state.admission.must_cache(&method, &uri);
    let key = format!("{method} {uri}");

    let outcome = query(&state, &key, use_cache).await;
    let elapsed = begin.elapsed();

    let mut resp = match outcome {
        Ok(cached) => {
            metrics::record_latency(&method, cached.status, elapsed);
            if is_http_error(cached.status_code()) {
                log::error!(
                    "request_id={request_id} method={method} uri={uri} response_status={} elapsed={elapsed:?} use_cache={use_cache} response_body: {}",
                    cached.status,
                    String::from_utf8_lossy(&cached.body)
                );
            } else {
                log::debug!(
                    "request_id={request_id} method={method} uri={uri} response_status={} elapsed={elapsed:?} use_cache={use_cache}",
                    cached.status
                );
            }
            render_response(&cached)
        }
        Err(err) => {
            metrics::record_latency(&method, 500, elapsed);
            log::error!(
                "request_id={request_id} method={method} uri={uri} response_status=500 elapsed={elapsed:?} use_cache={use_cache} response_error: {err:#}"
            );
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"))
        }
    };
    if let Ok(val) = request_id.parse() {
        resp.headers_mut()
            .insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    Ok(resp)
}

async fn query(state: &AppState, key: &str, use_cache: bool) -> Result<SerializedResponse> {
    if use_cache {
        let data = state.group.get(key).await?;
        return codec::decode(&data);
    }
    // admission reject: straight to the upstream, cache untouched
    let (data, _expiry) = state.loader.fetch_serialized(key).await?;
    codec::decode(&data)
}

fn render_response(cached: &SerializedResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(cached.status_code());
    for (name, values) in &cached.header {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    builder
        .body(Full::new(cached.body.clone()))
        .unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "render cached response")
        })
}

async fn run_health(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("health server: accept: {err}");
                        break;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move {
                            let resp = if req.uri().path() == state.health_path {
                                text_response(StatusCode::OK, "health ok\n")
                            } else {
                                text_response(StatusCode::NOT_FOUND, "not found")
                            };
                            Ok::<_, hyper::Error>(resp)
                        }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let _ = builder.serve_connection(io, service).await;
                });
            }
        }
    }
}

async fn run_metrics(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("metrics server: accept: {err}");
                        break;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move {
                            let resp = if req.uri().path() == state.metrics_path {
                                let stats = state.group.stats().await;
                                metrics::update_group_stats(&stats);
                                text_response(StatusCode::OK, &metrics::render())
                            } else {
                                text_response(StatusCode::NOT_FOUND, "not found")
                            };
                            Ok::<_, hyper::Error>(resp)
                        }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    let _ = builder.serve_connection(io, service).await;
                });
            }
        }
    }
}

async fn run_sweeper(store: Arc<Store>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let removed = store.purge_expired().await;
                if removed > 0 {
                    log::debug!("expired sweep removed {removed} entries");
                }
            }
        }
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        loop {
            tokio::select! {
                _ = async {
                    if let Some(sig) = sigterm.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    log::info!("received SIGTERM, initiating shutdown");
                    let _ = shutdown.send(true);
                    break;
                }
                _ = async {
                    if let Some(sig) = sigint.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    log::info!("received SIGINT, initiating shutdown");
                    let _ = shutdown.send(true);
                    break;
                }
            }
        }
    });
}

fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("parse listen address '{addr}'"))?;
    let listener = std::net::TcpListener::bind(socket_addr)
        .with_context(|| format!("bind {bind_addr}"))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener).context("register listener")
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
