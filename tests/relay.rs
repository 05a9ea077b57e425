//! End-to-end scenarios through a full relay instance.

use std::io::Write;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;

use mediarelay::core::{Core, CoreOpts};
use mediarelay::server::framed::{FramedPublisher, FramedReader};
use mediarelay::stream::{MediaInfo, Track, TrackKind, Unit};
use mediarelay::RelayError;

fn test_info() -> MediaInfo {
    MediaInfo {
        tracks: vec![
            Track {
                kind: TrackKind::Video,
                codec: "h264".into(),
                init: Bytes::from_static(b"\x67\x42"),
            },
            Track {
                kind: TrackKind::Audio,
                codec: "aac".into(),
                init: Bytes::new(),
            },
        ],
    }
}

/// Starts a relay with every listener on an ephemeral port.
async fn start_core(paths: &str) -> (Core, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("mediarelay.yml");
    let mut f = std::fs::File::create(&conf_path).unwrap();
    write!(
        f,
        "logLevel: error\n\
         api: true\n\
         apiAddress: 127.0.0.1:0\n\
         metrics: true\n\
         metricsAddress: 127.0.0.1:0\n\
         rtspAddress: 127.0.0.1:0\n\
         rtmpAddress: 127.0.0.1:0\n\
         hlsAddress: 127.0.0.1:0\n\
         hlsSegmentDuration: 500ms\n\
         webrtcAddress: 127.0.0.1:0\n\
         {paths}"
    )
    .unwrap();

    let core = Core::start(conf_path, CoreOpts::default()).await.unwrap();
    (core, dir)
}

#[tokio::test]
async fn test_publisher_to_reader_in_order() {
    let (core, _dir) = start_core("paths:\n  cam1:\n").await;
    let addr = core.addrs().rtsp.unwrap();

    let mut publisher = FramedPublisher::connect(addr, "cam1", None, None, test_info())
        .await
        .unwrap();
    let mut reader = FramedReader::connect(addr, "cam1", None, None, None)
        .await
        .unwrap();
    assert_eq!(reader.info().tracks.len(), 2);

    for i in 0..100u64 {
        publisher
            .send_unit(&Unit::new(
                0,
                Duration::from_millis(i),
                i == 0,
                Bytes::from(i.to_be_bytes().to_vec()),
            ))
            .await
            .unwrap();
    }

    for i in 0..100u64 {
        let unit = reader.recv_unit().await.unwrap().unwrap();
        assert_eq!(unit.payload.as_ref(), &i.to_be_bytes(), "unit {i}");
    }

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_on_demand_describe_times_out() {
    let (core, _dir) = start_core(
        "paths:\n  cam1:\n    runOnDemand: sleep 60\n    runOnDemandStartTimeout: 1s\n",
    )
    .await;
    let addr = core.addrs().rtsp.unwrap();

    let begin = Instant::now();
    let err = FramedReader::connect(addr, "cam1", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)), "got: {err:?}");
    assert!(begin.elapsed() >= Duration::from_millis(900));

    // the path is idle again and a publisher can claim it normally
    let _publisher = FramedPublisher::connect(addr, "cam1", None, None, test_info())
        .await
        .unwrap();

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_second_publisher_is_rejected() {
    let (core, _dir) = start_core("paths:\n  x:\n").await;
    let addr = core.addrs().rtsp.unwrap();

    let _first = FramedPublisher::connect(addr, "x", None, None, test_info())
        .await
        .unwrap();
    let err = FramedPublisher::connect(addr, "x", None, None, test_info())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Busy(n) if n.contains('x')));

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_reload_rebuilds_only_changed_path() {
    let (core, _dir) = start_core("paths:\n  cam1:\n  cam2:\n").await;
    let rtsp = core.addrs().rtsp.unwrap();
    let api = core.addrs().api.unwrap();

    let _pub1 = FramedPublisher::connect(rtsp, "cam1", None, None, test_info())
        .await
        .unwrap();
    let mut pub2 = FramedPublisher::connect(rtsp, "cam2", None, None, test_info())
        .await
        .unwrap();
    let mut reader2 = FramedReader::connect(rtsp, "cam2", None, None, None)
        .await
        .unwrap();

    // repoint cam1 at an upstream source; cam2 is untouched
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{api}/v1/config/set"))
        .json(&serde_json::json!({
            "paths": { "cam1": { "source": "rtsp://upstream/cam1", "sourceOnDemand": true } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // cam1 loses its publisher
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let paths: serde_json::Value = client
            .get(format!("http://{api}/v1/paths/list"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let cam1_down = paths["items"]["cam1"]["sourceReady"] != true;
        let cam2_up = paths["items"]["cam2"]["sourceReady"] == true;
        if cam1_down && cam2_up {
            break;
        }
        assert!(Instant::now() < deadline, "cam1 was not rebuilt: {paths}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // cam2's reader keeps receiving, uninterrupted
    pub2.send_unit(&Unit::new(0, Duration::ZERO, true, Bytes::from_static(b"live")))
        .await
        .unwrap();
    let unit = reader2.recv_unit().await.unwrap().unwrap();
    assert_eq!(unit.payload.as_ref(), b"live");

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_read_auth_challenge_then_accept() {
    let (core, _dir) = start_core(
        "paths:\n  secret:\n    readUser: u\n    readPass: p\n",
    )
    .await;
    let addr = core.addrs().rtsp.unwrap();

    let _publisher = FramedPublisher::connect(addr, "secret", None, None, test_info())
        .await
        .unwrap();

    // no credentials: challenge
    let err = FramedReader::connect(addr, "secret", None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AuthNotCritical));

    // wrong credentials: rejected
    let err = FramedReader::connect(addr, "secret", Some("u"), Some("wrong"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AuthCritical(_)));

    // correct credentials: attached
    let _reader = FramedReader::connect(addr, "secret", Some("u"), Some("p"), None)
        .await
        .unwrap();

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_hls_playlist_and_segments() {
    let (core, _dir) = start_core("paths:\n  cam1:\n").await;
    let rtsp = core.addrs().rtsp.unwrap();
    let hls = core.addrs().hls.unwrap();

    let mut publisher = FramedPublisher::connect(rtsp, "cam1", None, None, test_info())
        .await
        .unwrap();

    // keep publishing "video" with a keyframe every 500 ms; the muxer only
    // sees units written after its first request attaches it
    let feeder = tokio::spawn(async move {
        for i in 0u64.. {
            if publisher
                .send_unit(&Unit::new(
                    0,
                    Duration::from_millis(i * 100),
                    i % 5 == 0,
                    Bytes::from(vec![i as u8; 32]),
                ))
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let playlist = loop {
        let resp = client
            .get(format!("http://{hls}/cam1/index.m3u8"))
            .send()
            .await
            .unwrap();
        if resp.status() == reqwest::StatusCode::OK {
            let text = resp.text().await.unwrap();
            if text.contains("seg0.mp4") {
                break text;
            }
        }
        assert!(Instant::now() < deadline, "no playlist in time");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    assert!(playlist.starts_with("#EXTM3U"));
    feeder.abort();

    let seg = client
        .get(format!("http://{hls}/cam1/seg0.mp4"))
        .send()
        .await
        .unwrap();
    assert_eq!(seg.status(), reqwest::StatusCode::OK);
    assert!(!seg.bytes().await.unwrap().is_empty());

    // unknown path stays a 404
    let resp = client
        .get(format!("http://{hls}/ghost/index.m3u8"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_metrics_and_conn_listing() {
    let (core, _dir) = start_core("paths:\n  cam1:\n").await;
    let rtsp = core.addrs().rtsp.unwrap();
    let api = core.addrs().api.unwrap();
    let metrics = core.addrs().metrics.unwrap();

    let _publisher = FramedPublisher::connect(rtsp, "cam1", None, None, test_info())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let conns: serde_json::Value = client
        .get(format!("http://{api}/v1/rtspconns/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = conns["items"].as_object().unwrap();
    assert_eq!(items.len(), 1);
    let (id, item) = items.iter().next().unwrap();
    assert_eq!(item["state"], "publish");
    assert!(item["created"].as_str().unwrap().ends_with('Z'));

    let text = client
        .get(format!("http://{metrics}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("paths{name=\"cam1\",state=\"ready\"} 1"));
    assert!(text.contains("rtsp_conns{state=\"publish\"} 1"));

    // kick the publisher through the API
    let resp = client
        .post(format!("http://{api}/v1/rtspconns/kick/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let conns: serde_json::Value = client
            .get(format!("http://{api}/v1/rtspconns/list"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if conns["items"].as_object().unwrap().is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "kicked connection not removed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    core.close();
    core.wait().await;
}

#[tokio::test]
async fn test_slow_reader_is_evicted_fast_reader_unaffected() {
    use mediarelay::auth::AccessInfo;
    use mediarelay::conf::Conf;
    use mediarelay::externalcmd::{Pool, ProcessLauncher};
    use mediarelay::path::manager::{PathManager, PathManagerOpts};
    use mediarelay::path::source::UnsupportedSourceDriver;
    use mediarelay::stream::StreamReadError;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let token = CancellationToken::new();
    let conf: Conf =
        Conf::from_value(serde_yaml::from_str("paths:\n  cam1:\n").unwrap()).unwrap();
    let manager = PathManager::spawn(
        PathManagerOpts {
            read_buffer_count: 8,
            auth_timeout: Duration::from_secs(1),
            external_auth_url: None,
            paths: conf.paths,
            pool: Pool::new(Arc::new(ProcessLauncher)),
            source_driver: Arc::new(UnsupportedSourceDriver),
        },
        token.clone(),
    );

    let access = AccessInfo {
        ip: "127.0.0.1".parse().unwrap(),
        user: None,
        pass: None,
        query: String::new(),
        protocol: "rtsp",
    };

    let publisher = manager
        .publish("cam1", access.clone(), test_info())
        .await
        .unwrap();
    let mut slow = manager.read("cam1", access.clone(), None).await.unwrap();
    let mut fast = manager.read("cam1", access, None).await.unwrap();

    for i in 0..1000u64 {
        publisher
            .stream()
            .write(0, Duration::from_millis(i), false, Bytes::from_static(b"u"));
        // the fast reader keeps up with the publisher
        let unit = fast.next().await.unwrap();
        assert_eq!(unit.seq, i);
    }

    // the slow reader never consumed and is now far beyond the window
    assert!(matches!(
        slow.next().await,
        Err(StreamReadError::Overflow { .. })
    ));

    token.cancel();
}
