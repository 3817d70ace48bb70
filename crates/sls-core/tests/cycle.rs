//! End-to-end submit cycles over real helpers and a stub endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sls_core::config::ConfigStore;
use sls_core::data::DataStore;
use sls_core::helpers::gpu::GpuHelper;
use sls_core::helpers::kdump::KdumpHelper;
use sls_core::lockfile::Lockfile;
use sls_core::process::ProcTree;
use sls_core::remote::{NetworkProbe, http_client};
use sls_core::staging::{ArtifactState, Staging};
use sls_core::{Helper, Registry, Runner, Services};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers one request per connection with the next scripted status and
/// records the request lines.
async fn stub(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    tokio::spawn(async move {
        for status in statuses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break Some(pos + 4);
                }
            };
            let Some(header_end) = header_end else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
            let length: usize = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse().ok())
                .unwrap_or(0);
            let mut body = buf.len() - header_end;
            while body < length {
                let n = stream.read(&mut chunk).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                body += n;
            }
            record
                .lock()
                .unwrap()
                .push(head.lines().next().unwrap_or_default().to_string());
            let reply = format!(
                "HTTP/1.1 {status} Stub\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
            );
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (base, seen)
}

struct Setup {
    _dir: tempfile::TempDir,
    services: Services,
}

fn setup(base_url: &str) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::from_paths(None, None, Some(&dir.path().join("local.toml"))).into_shared();
    {
        let mut store = config.lock().unwrap();
        let dsn = format!("{}/9", base_url.replacen("http://", "http://key@", 1));
        store.set("helpers.gpu", "dsn", dsn.clone());
        store.set("helpers.kdump", "dsn", dsn);
    }
    let staging = Staging::new(dir.path().join("base"));
    let data = DataStore::new(staging.data_dir()).into_shared();
    let services = Services {
        config,
        data,
        staging,
        http: http_client(Duration::from_secs(5)).unwrap(),
        probe: NetworkProbe {
            url: format!("{base_url}/204"),
            attempts: 1,
            pause: Duration::from_millis(10),
            timeout: Duration::from_secs(1),
        },
        proc: ProcTree::new(dir.path().join("proc")),
        sysfs: dir.path().join("sys"),
    };
    Setup {
        _dir: dir,
        services,
    }
}

fn stage(staging: &Staging, category: &str, name: &str, content: &[u8]) {
    staging.ensure_category(category, None).unwrap();
    std::fs::write(staging.pending(category).join(name), content).unwrap();
}

fn runner(services: &Services, helper: Arc<dyn Helper>) -> Runner {
    Runner::new(services.clone(), Registry::new(vec![helper]))
}

#[tokio::test]
async fn transient_failure_is_retried_next_cycle() {
    // probe, store (500), probe, store (200)
    let (base, seen) = stub(vec![204, 500, 204, 200]).await;
    let setup = setup(&base);
    let staging = &setup.services.staging;
    stage(staging, "gpu", "1700000000.json", br#"{"comm":"game","appid":70}"#);
    let runner = runner(&setup.services, Arc::new(GpuHelper));

    let first = runner.submit().await;
    assert_eq!(first.deferred, 1);
    assert_eq!(
        staging.state_of("gpu", "1700000000.json"),
        Some(ArtifactState::Pending)
    );

    let second = runner.submit().await;
    assert_eq!(second.uploaded, 1);
    assert_eq!(
        staging.state_of("gpu", "1700000000.json"),
        Some(ArtifactState::Uploaded)
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen[0].starts_with("HEAD /204"));
    assert!(seen[1].starts_with("POST /api/9/store/"));
}

#[tokio::test]
async fn empty_kdump_archive_fails_permanently() {
    let (base, seen) = stub(vec![204]).await;
    let setup = setup(&base);
    let staging = &setup.services.staging;
    stage(staging, "kdump", "crash.zip", b"");

    let summary = runner(&setup.services, Arc::new(KdumpHelper)).submit().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(staging.state_of("kdump", "crash.zip"), Some(ArtifactState::Failed));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn contended_category_is_left_alone() {
    let (base, seen) = stub(vec![204]).await;
    let setup = setup(&base);
    let staging = &setup.services.staging;
    stage(staging, "gpu", "1.json", b"{}");
    let held = Lockfile::acquire(staging.lock_path("gpu")).unwrap();

    let summary = runner(&setup.services, Arc::new(GpuHelper)).submit().await;
    assert_eq!(summary.contended, 1);
    assert_eq!(staging.state_of("gpu", "1.json"), Some(ArtifactState::Pending));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(held.is_held());
    assert!(Path::new(&staging.lock_path("gpu")).exists());
}
