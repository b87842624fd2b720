// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hazard_watch::clock::{Clock, SystemClock};
use hazard_watch::config::{AppConfig, DEFAULT_CONFIG_PATH};
use hazard_watch::detection::{DetectionResult, Detector, DetectorFactory, ReplayDetector};
use hazard_watch::enrichment::{EnrichmentClient, VisionAnalyzer};
use hazard_watch::incident::{IncidentManager, IncidentQuery, IncidentStore, JsonIncidentStore};
use hazard_watch::notification::build_notifier;
use hazard_watch::realtime::RealtimeBroadcaster;
use hazard_watch::session::{
    CameraPreviewRegistry, DefaultSourceOpener, SessionOrchestrator, SessionServices, VideoSource,
};
use hazard_watch::types::Frame;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hazard-watch", about = "Water-hazard watch over a frame source")]
struct Args {
    /// Settings file (YAML)
    #[arg(long, env = "APP_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one detection session until the source ends or Ctrl-C
    Watch {
        /// Frame directory, image or video path, or a camera index with --webcam
        source: String,

        #[arg(long)]
        webcam: bool,

        /// JSONL detections to replay against the frames
        #[arg(long)]
        detections: Option<PathBuf>,

        /// Print realtime messages to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Print stored incidents, newest first
    Incidents {
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Used when no detections file is given: nothing is ever detected.
struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        Ok(DetectionResult::empty(frame.width, frame.height))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("hazard_watch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🌊 Hazard Watch starting");
    info!("✓ Configuration loaded from {}", args.config.display());
    if let Ok(yaml) = serde_yaml::to_string(&config.masked()) {
        tracing::debug!("Effective configuration:\n{}", yaml);
    }

    match args.command {
        Command::Incidents { page, limit } => list_incidents(&config, page, limit),
        Command::Watch {
            source,
            webcam,
            detections,
            events,
        } => {
            let source = VideoSource::parse(&source, webcam)?;
            watch(config, source, detections, events)
        }
    }
}

fn list_incidents(config: &AppConfig, page: usize, limit: usize) -> Result<()> {
    let store = JsonIncidentStore::open(Path::new(&config.incident_output_dir))?;
    let page = store.list(&IncidentQuery {
        page,
        limit,
        ..IncidentQuery::default()
    });
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

fn watch(
    config: AppConfig,
    source: VideoSource,
    detections: Option<PathBuf>,
    events: bool,
) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let broadcaster = Arc::new(RealtimeBroadcaster::from_config(&config.realtime));
    if events {
        // Mailbox sized by realtime.observer_buffer.
        let (_, messages) = broadcaster.subscribe_channel();
        thread::Builder::new()
            .name("event-printer".to_string())
            .spawn(move || {
                for message in messages {
                    println!("{}", message);
                }
            })
            .context("Failed to spawn event printer")?;
    }

    let output_dir = PathBuf::from(&config.incident_output_dir);
    let store: Arc<dyn IncidentStore> = Arc::new(JsonIncidentStore::open(&output_dir)?);
    let incidents = Arc::new(IncidentManager::new(
        &output_dir,
        store,
        build_notifier(&config.email),
        Some(Arc::clone(&broadcaster)),
    )?);
    info!("✓ Incident store ready in {}", output_dir.display());

    // The blocking HTTP client must be built outside any async runtime.
    let analyzer: Option<Arc<dyn VisionAnalyzer>> = match EnrichmentClient::from_config(&config.enrichment) {
        Ok(Some(client)) => {
            info!("🧠 Enrichment via {} at {}", client.kind(), client.endpoint());
            let client: Arc<dyn VisionAnalyzer> = Arc::new(client);
            Some(client)
        }
        Ok(None) => {
            info!("🧠 Enrichment disabled");
            None
        }
        Err(e) => {
            warn!("Enrichment client unavailable, continuing without it: {:#}", e);
            None
        }
    };

    let detectors: Arc<dyn DetectorFactory> = match detections {
        Some(path) => Arc::new(move || -> Result<Box<dyn Detector>> {
            Ok(Box::new(ReplayDetector::load(&path)?))
        }),
        None => {
            warn!("No --detections file given; frames will be processed without detections");
            Arc::new(|| -> Result<Box<dyn Detector>> { Ok(Box::new(NullDetector)) })
        }
    };

    let orchestrator = SessionOrchestrator::new(SessionServices {
        sources: Arc::new(DefaultSourceOpener::new(Arc::clone(&clock))),
        config,
        clock,
        detectors,
        incidents,
        analyzer,
        broadcaster,
        cameras: Arc::new(CameraPreviewRegistry::new()),
    });

    let session_id = orchestrator.start(source)?;
    info!("Session {} running; press Ctrl-C to stop", session_id);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(wait_for_end(&orchestrator));

    orchestrator.shutdown();
    let snapshot = orchestrator.status();
    info!(
        "📊 Done: {} frames, {:.1}s, {} incidents",
        snapshot.current_frame, snapshot.elapsed_time, snapshot.incidents_detected
    );
    Ok(())
}

async fn wait_for_end(orchestrator: &SessionOrchestrator) {
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                match signal {
                    Ok(()) => info!("Ctrl-C received, stopping"),
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                }
                return;
            }
            _ = poll.tick() => {
                if !orchestrator.is_running() {
                    return;
                }
            }
        }
    }
}
