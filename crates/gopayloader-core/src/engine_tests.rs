//! End-to-end engine tests against a local HTTP/1.1 server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientKind, RunConfig};
use crate::engine::Payloader;

async fn spawn_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    Ok::<_, std::convert::Infallible>(hyper::Response::new(Full::new(
                        bytes::Bytes::from_static(b"hello"),
                    )))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

fn config(addr: SocketAddr, client: ClientKind) -> RunConfig {
    RunConfig {
        req_uri: format!("http://{}/", addr),
        client,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_reqs_fasthttp() {
    let addr = spawn_server().await;
    let cfg = RunConfig {
        reqs: 21,
        conns: 10,
        ..config(addr, ClientKind::FastHttp1)
    };
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.completed, 21);
    assert_eq!(result.failed, 0);
    assert_eq!(result.responses.get(&200), Some(&21));
    assert!(result.errors.is_empty());

    // status histogram accounts for every completed request
    let histogram_total: u64 = result.responses.values().sum();
    assert_eq!(histogram_total, result.completed);

    // latency ordering holds whenever something completed
    assert!(result.latency.min <= result.latency.average);
    assert!(result.latency.average <= result.latency.max);
    assert!(result.rps.average > 0.0);

    // byte sizes scale with the completed count
    assert!(result.req_byte_size.single > 0);
    assert_eq!(
        result.req_byte_size.total,
        result.req_byte_size.single * result.completed as i64
    );
    assert!(result.resp_byte_size.single > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_reqs_nethttp1_single_conn() {
    let addr = spawn_server().await;
    let cfg = RunConfig {
        reqs: 15,
        conns: 1,
        ..config(addr, ClientKind::NetHttp1)
    };
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.completed, 15);
    assert_eq!(result.failed, 0);
    assert_eq!(result.responses.get(&200), Some(&15));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fixed_duration_runs_full_window() {
    let addr = spawn_server().await;
    let cfg = RunConfig {
        reqs: 0,
        conns: 2,
        duration: Duration::from_secs(2),
        ..config(addr, ClientKind::FastHttp1)
    };
    let started = Instant::now();
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(result.completed >= 2, "at least one request per worker");
    assert_eq!(result.failed, 0);
    assert_eq!(result.responses.get(&200), Some(&result.completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paced_reqs_hit_target() {
    let addr = spawn_server().await;
    let cfg = RunConfig {
        reqs: 20,
        conns: 4,
        duration: Duration::from_secs(2),
        ..config(addr, ClientKind::FastHttp1)
    };
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.completed, 20);
    assert_eq!(result.responses.get(&200), Some(&20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uneven_quota_still_sums_to_target() {
    let addr = spawn_server().await;
    // 23 requests over 5 connections: 3 workers get an extra request
    let cfg = RunConfig {
        reqs: 23,
        conns: 5,
        ..config(addr, ClientKind::FastHttp1)
    };
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.completed + result.failed, 23);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_returns_partial_results_quickly() {
    let addr = spawn_server().await;
    let cfg = RunConfig {
        reqs: 0,
        conns: 2,
        duration: Duration::from_secs(30),
        ..config(addr, ClientKind::FastHttp1)
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = Payloader::new(cfg).run(cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.completed > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jwt_run_fills_cache_and_attaches_tokens() {
    let addr = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("GOPAYLOADER_CACHE_DIR", dir.path());

    let key_path = dir.path().join("hmac.secret");
    std::fs::write(&key_path, b"engine-test-secret").unwrap();

    let cfg = RunConfig {
        reqs: 12,
        conns: 3,
        jwt_header: "Authorization".to_string(),
        jwt_key: Some(key_path),
        jwt_kid: "k1".to_string(),
        jwt_iss: "iss".to_string(),
        ..config(addr, ClientKind::FastHttp1)
    };
    let result = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.completed, 12);
    assert_eq!(result.failed, 0);

    let store = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("gopayloader-jwtstore-")
        })
        .expect("cache file created");
    assert!(store.metadata().unwrap().len() > 0);
}

#[tokio::test]
async fn invalid_config_fails_before_workers_start() {
    let cfg = RunConfig {
        req_uri: "http://localhost/".to_string(),
        reqs: 10,
        ..Default::default()
    };
    let err = Payloader::new(cfg)
        .run(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scheme://host:port/path"));
}
