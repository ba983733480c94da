//! Wiring and lifecycle.
//!
//! `Engine::new` builds every component and the cells between them;
//! `spawn` starts the compositor thread, the detection thread and the HTTP
//! server. Nothing touches the camera or the model until the first request
//! opens the activity gate.

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::activity::ActivityGate;
use crate::api::{ApiHandle, ApiServer, ApiState};
use crate::broadcast::StreamBroadcaster;
use crate::cell::LatestCell;
use crate::config::EngineConfig;
use crate::detect::{build_backend, DetectorBackend};
use crate::history::HistoryStore;
use crate::ingest::{open_capture, BackoffPolicy, ResilientConnection, VideoCapture};
use crate::render::{load_font, CompositorChannels, FrameCompositor, Placeholders};
use crate::source::FrameSource;
use crate::stats::{StatsBoard, StatsEndpoint};
use crate::worker::{DetectionWorker, WorkerChannels};

const SAVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Engine {
    cfg: EngineConfig,
    gate: Arc<ActivityGate>,
    history: HistoryStore,
    compositor: FrameCompositor,
    worker: DetectionWorker,
    api_state: ApiState,
}

impl Engine {
    /// Build from configuration: camera by URL scheme, detector by model path.
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        let capture = open_capture(&cfg.capture_settings())?;
        let backend = build_backend(&cfg.detection.model_path, cfg.detection.confidence)?;
        Self::with_parts(cfg, capture, backend)
    }

    /// Build around an existing capture device and detector.
    pub fn with_parts(
        cfg: EngineConfig,
        capture: Box<dyn VideoCapture>,
        backend: Box<dyn DetectorBackend>,
    ) -> Result<Self> {
        cfg.validate()?;
        let gate = Arc::new(ActivityGate::new(cfg.idle_timeout));
        let history = HistoryStore::load(&cfg.history_path);
        let board = Arc::new(StatsBoard::new());

        let inference = Arc::new(LatestCell::new());
        let boxes = Arc::new(LatestCell::new());
        let output = Arc::new(LatestCell::new());

        let render = cfg.render_settings();
        let font = load_font(render.font_path.as_deref());
        let placeholders = Placeholders::render(&render, font.as_ref())?;

        log::info!(
            "camera {} via {}, detector {}",
            capture.describe(),
            if cfg.camera.rtsp_tcp { "tcp" } else { "default transport" },
            backend.name()
        );
        let source = FrameSource::new(ResilientConnection::new(
            capture,
            BackoffPolicy::default(),
            cfg.stall_timeout,
        ));

        let broadcaster = StreamBroadcaster::new(
            Arc::clone(&output),
            Arc::clone(&gate),
            Arc::clone(&placeholders.standby),
            cfg.output.stream_fps,
        );
        let compositor = FrameCompositor::new(
            CompositorChannels {
                gate: Arc::clone(&gate),
                inference: Arc::clone(&inference),
                boxes: Arc::clone(&boxes),
                output,
            },
            source,
            render,
            placeholders,
            font,
        );
        let worker = DetectionWorker::new(
            WorkerChannels {
                gate: Arc::clone(&gate),
                input: inference,
                boxes,
                board: Arc::clone(&board),
                history: history.clone(),
            },
            backend,
            cfg.detection.interval,
        );
        let api_state = ApiState {
            stats: StatsEndpoint::new(board, history.clone(), Arc::clone(&gate)),
            broadcaster,
        };

        Ok(Self {
            cfg,
            gate,
            history,
            compositor,
            worker,
            api_state,
        })
    }

    pub fn gate(&self) -> &Arc<ActivityGate> {
        &self.gate
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn stats(&self) -> &StatsEndpoint {
        &self.api_state.stats
    }

    pub fn broadcaster(&self) -> &StreamBroadcaster {
        &self.api_state.broadcaster
    }

    /// Start the compositor, detection and API threads.
    pub fn spawn(self) -> Result<EngineHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let compositor = self.compositor;
        let flag = Arc::clone(&shutdown);
        threads.push(
            std::thread::Builder::new()
                .name("compositor".into())
                .spawn(move || compositor.run(&flag))
                .context("spawn compositor thread")?,
        );

        let worker = self.worker;
        let flag = Arc::clone(&shutdown);
        let spawned = std::thread::Builder::new()
            .name("detection".into())
            .spawn(move || worker.run(&flag))
            .context("spawn detection thread");
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(err) => {
                stop_threads(&shutdown, threads);
                return Err(err);
            }
        }

        let api = match ApiServer::new(self.cfg.api_config(), self.api_state).spawn() {
            Ok(api) => api,
            Err(err) => {
                stop_threads(&shutdown, threads);
                return Err(err);
            }
        };

        Ok(EngineHandle {
            addr: api.addr,
            api: Some(api),
            shutdown,
            threads,
            gate: self.gate,
            history: self.history,
        })
    }
}

pub struct EngineHandle {
    pub addr: SocketAddr,
    api: Option<ApiHandle>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    gate: Arc<ActivityGate>,
    history: HistoryStore,
}

impl EngineHandle {
    /// Stop serving, join every thread, close the camera and flush history.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let api_result = match self.api.take() {
            Some(api) => api.stop(),
            None => Ok(()),
        };
        let panicked = stop_threads(&self.shutdown, std::mem::take(&mut self.threads));

        if !self.history.wait_for_saves(SAVE_DRAIN_TIMEOUT) {
            log::warn!("history saves still pending at shutdown");
        }
        self.history
            .save_now()
            .context("final history save failed")?;
        log::info!("engine stopped; total_all_time={}", self.history.total());

        api_result?;
        if panicked > 0 {
            return Err(anyhow!("{} engine thread(s) panicked", panicked));
        }
        Ok(())
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn gate(&self) -> &Arc<ActivityGate> {
        &self.gate
    }
}

/// Signal shutdown and join. Returns how many threads panicked.
fn stop_threads(shutdown: &AtomicBool, threads: Vec<JoinHandle<()>>) -> usize {
    shutdown.store(true, Ordering::SeqCst);
    threads
        .into_iter()
        .filter_map(|handle| {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            handle.join().err().map(|_| {
                log::error!("{} thread panicked", name);
            })
        })
        .count()
}
