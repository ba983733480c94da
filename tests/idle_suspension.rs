use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;

use traffic_engine::{Detection, DetectorBackend, Engine, EngineConfig, Frame, VideoCapture};

#[derive(Clone, Default)]
struct Calls {
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    detects: Arc<AtomicUsize>,
}

struct CountingCapture(Calls);

impl VideoCapture for CountingCapture {
    fn describe(&self) -> String {
        "counting".to_string()
    }

    fn open(&mut self) -> Result<()> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        Ok(Some(RgbImage::new(64, 36)))
    }

    fn release(&mut self) {}
}

struct CountingDetector(Calls);

impl DetectorBackend for CountingDetector {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn tracks_objects(&self) -> bool {
        true
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.0.detects.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn no_camera_or_model_work_without_requests() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let calls = Calls::default();
    let mut cfg = EngineConfig::default();
    cfg.api_addr = "127.0.0.1:0".to_string();
    cfg.output.width = 64;
    cfg.output.height = 36;
    cfg.detection.interval = Duration::from_millis(20);
    cfg.idle_timeout = Duration::from_secs(1);
    cfg.history_path = dir.path().join("history.json");

    let engine = Engine::with_parts(
        cfg,
        Box::new(CountingCapture(calls.clone())),
        Box::new(CountingDetector(calls.clone())),
    )?;
    let handle = engine.spawn()?;

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(calls.opens.load(Ordering::SeqCst), 0);
    assert_eq!(calls.reads.load(Ordering::SeqCst), 0);
    assert_eq!(calls.detects.load(Ordering::SeqCst), 0);

    // One stats poll opens the gate.
    let mut stream = TcpStream::connect(handle.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /api/stats HTTP/1.1\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    assert!(wait_for(Duration::from_secs(5), || {
        calls.detects.load(Ordering::SeqCst) > 0
    }));
    assert_eq!(calls.opens.load(Ordering::SeqCst), 1);

    // After the idle timeout the camera is released and the model goes quiet.
    assert!(wait_for(Duration::from_secs(5), || !handle.gate().is_active()));
    std::thread::sleep(Duration::from_millis(700));
    let reads = calls.reads.load(Ordering::SeqCst);
    let detects = calls.detects.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(calls.reads.load(Ordering::SeqCst), reads);
    assert_eq!(calls.detects.load(Ordering::SeqCst), detects);

    handle.stop()?;
    Ok(())
}
