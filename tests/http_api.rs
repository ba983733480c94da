use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde_json::Value;

use traffic_engine::detect::StubBackend;
use traffic_engine::ingest::{CaptureSettings, SyntheticCapture, VideoCapture};
use traffic_engine::{Engine, EngineConfig, EngineHandle};

fn start(dir: &tempfile::TempDir) -> Result<EngineHandle> {
    let capture = SyntheticCapture::new(CaptureSettings {
        target_fps: 20,
        ..CaptureSettings::default()
    });
    start_with(dir, Box::new(capture))
}

fn start_with(dir: &tempfile::TempDir, capture: Box<dyn VideoCapture>) -> Result<EngineHandle> {
    let mut cfg = EngineConfig::default();
    cfg.api_addr = "127.0.0.1:0".to_string();
    cfg.output.width = 160;
    cfg.output.height = 90;
    cfg.output.target_fps = 20;
    cfg.output.stream_fps = 20;
    cfg.history_path = dir.path().join("history.json");
    Engine::with_parts(cfg, capture, Box::new(StubBackend::new()))?.spawn()
}

/// A camera that refuses every connection.
struct DeadCamera;

impl VideoCapture for DeadCamera {
    fn describe(&self) -> String {
        "dead camera".to_string()
    }

    fn open(&mut self) -> Result<()> {
        Err(anyhow!("connection refused"))
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        Err(anyhow!("not open"))
    }

    fn release(&mut self) {}
}

fn request(addr: SocketAddr, raw: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(raw.as_bytes())?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response)
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[test]
fn stats_endpoint_returns_fixed_schema() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&dir)?;

    let response = request(handle.addr, "GET /api/stats HTTP/1.1\r\nHost: test\r\n\r\n")?;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: application/json"));
    let stats: Value = serde_json::from_str(body(&response))?;
    for key in ["PERSON", "BICYCLE", "CAR", "MOTORCYCLE", "BUS", "TRUCK"] {
        assert!(stats[key].is_u64(), "missing {}", key);
    }
    assert!(stats["status"].is_string());
    assert_eq!(stats["total_all_time"], 0);

    // A stats poll alone keeps the engine awake.
    assert!(handle.gate().is_active());
    handle.stop()?;
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&dir)?;

    let missing = request(handle.addr, "GET /nope HTTP/1.1\r\n\r\n")?;
    assert!(missing.starts_with("HTTP/1.1 404"));
    let post = request(handle.addr, "POST /api/stats HTTP/1.1\r\nContent-Length: 0\r\n\r\n")?;
    assert!(post.starts_with("HTTP/1.1 405"));
    let health = request(handle.addr, "GET /health HTTP/1.1\r\n\r\n")?;
    assert_eq!(body(&health), r#"{"status":"ok"}"#);

    handle.stop()?;
    Ok(())
}

fn read_until(stream: &mut TcpStream, needle: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while !data.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut buf)?;
        if n == 0 || data.len() > limit {
            anyhow::bail!("stream ended before {:?}", String::from_utf8_lossy(needle));
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

#[test]
fn video_feed_streams_multipart_jpeg_and_releases_viewers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&dir)?;

    let mut viewers = Vec::new();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(handle.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: test\r\n\r\n")?;
        let data = read_until(&mut stream, b"\xFF\xD9", 1 << 22)?;
        let text = String::from_utf8_lossy(&data);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(text.contains("--frame\r\nContent-Type: image/jpeg"));
        viewers.push(stream);
    }
    assert_eq!(handle.gate().viewer_count(), 3);

    drop(viewers);
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.gate().viewer_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(handle.gate().viewer_count(), 0);

    handle.stop()?;
    Ok(())
}

#[test]
fn video_feed_keeps_streaming_while_camera_is_down() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start_with(&dir, Box::new(DeadCamera))?;

    let mut stream = TcpStream::connect(handle.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: test\r\n\r\n")?;
    let started = Instant::now();
    let mut data = read_until(&mut stream, b"\xFF\xD9", 1 << 22)?;
    assert!(String::from_utf8_lossy(&data).starts_with("HTTP/1.1 200 OK"));

    // Keep reading until several more parts have arrived.
    let mut buf = [0u8; 4096];
    let marker: &[u8] = b"--frame\r\n";
    let parts = |data: &[u8]| data.windows(marker.len()).filter(|w| *w == marker).count();
    while parts(&data) < 4 {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            anyhow::bail!("stream closed while camera was down");
        }
        data.extend_from_slice(&buf[..n]);
    }
    assert!(started.elapsed() < Duration::from_secs(5));

    let stats = request(handle.addr, "GET /api/stats HTTP/1.1\r\n\r\n")?;
    assert!(stats.starts_with("HTTP/1.1 200 OK"));

    drop(stream);
    handle.stop()?;
    Ok(())
}
