mod support;

use std::time::Duration;

use http::StatusCode;
use support::*;

use cachemesh::codec;
use cachemesh::peer::PeerClient;
use cachemesh::ring::Ring;

fn two_peer_ring(peer_a: &str, peer_b: &str) -> Ring {
    let ring = Ring::new(peer_a.to_string());
    ring.replace(
        [peer_a.to_string(), peer_b.to_string()]
            .into_iter()
            .collect(),
    );
    ring
}

/// Find a path whose cache key hashes to `owner` on the given ring.
fn path_owned_by(ring: &Ring, owner: &str) -> String {
    (0..500)
        .map(|i| format!("/peer/{i}"))
        .find(|p| ring.owner(&format!("GET {p}")) == owner)
        .expect("no key landed on the wanted owner")
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_owner_invokes_loader_once() {
    let upstream = MockServer::start(|_req| {
        std::thread::sleep(Duration::from_millis(50));
        text(StatusCode::OK, "peer-value")
    })
    .await;

    let peer_a = "127.0.0.1:19081";
    let peer_b = "127.0.0.1:19091";

    let mut cfg_a = test_config(19080, &upstream.url());
    cfg_a.peers = vec![peer_b.to_string()];
    let mut cfg_b = test_config(19090, &upstream.url());
    cfg_b.peers = vec![peer_a.to_string()];

    let proxy_a = spawn_app(cfg_a).await;
    let proxy_b = spawn_app(cfg_b).await;

    // let both discovery loops publish the two-peer set
    tokio::time::sleep(Duration::from_millis(300)).await;

    let ring = two_peer_ring(peer_a, peer_b);
    let path = path_owned_by(&ring, peer_b);

    // a request on A routes to B, which loads exactly once
    let resp = get(proxy_a, &path).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body_str(), "peer-value");
    assert_eq!(upstream.hits(), 1);

    // B already holds the entry locally: had A loaded it itself instead of
    // delegating, this request would hit the upstream a second time
    let resp = get(proxy_b, &path).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body_str(), "peer-value");
    assert_eq!(upstream.hits(), 1);

    let resp = get(proxy_a, &path).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_wire_serves_serialized_entries() {
    let upstream = MockServer::start(|_req| text(StatusCode::OK, "wire-body")).await;

    let cfg = test_config(19180, &upstream.url());
    let peer_addr = format!("127.0.0.1:{}", cfg.groupcache_port);
    spawn_app(cfg).await;

    let client = PeerClient::new(Duration::from_secs(2));
    let entry = client
        .fetch("responses", "GET /wire", &peer_addr)
        .await
        .expect("peer fetch");

    let resp = codec::decode(&entry.bytes).expect("decode entry");
    assert_eq!(resp.status, 200);
    assert_eq!(&resp.body[..], b"wire-body");
    assert!(entry.expiry > std::time::SystemTime::now());
    assert_eq!(upstream.hits(), 1);

    // unknown group is an explicit 404, surfaced as a client error
    let err = client
        .fetch("missing-group", "GET /wire", &peer_addr)
        .await
        .expect_err("unknown group must fail");
    assert!(format!("{err:#}").contains("404"));
}
