//! relayd - real-time detection relay daemon
//!
//! This daemon:
//! 1. Captures frames from a device, file, stream URL or `stub://` source
//! 2. Runs the configured detector on a dedicated inference thread
//! 3. Publishes per-detection metadata records to Redis (optional)
//! 4. Re-encodes annotated frames and pushes them to an RTMP endpoint (optional)
//!
//! Configuration layers: defaults, `RELAY_CONFIG` file, `RELAY_*` env, flags.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use detection_relay::config::RelayConfig;
use detection_relay::pipeline::StageExit;
use detection_relay::{
    open_backend, open_source, Coordinator, DetectParams, MetadataPublisher, OverflowPolicy,
    StopToken, StreamSink,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a detector over a video source and relay the results")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Model weights (ONNX), or `stub` for the synthetic detector.
    #[arg(long)]
    model: Option<String>,

    /// Input source: device index, file path, stream URL or stub://name.
    #[arg(long)]
    source: Option<String>,

    /// Confidence threshold.
    #[arg(long)]
    conf: Option<f32>,

    /// IoU threshold for non-maximum suppression.
    #[arg(long)]
    iou: Option<f32>,

    /// Compute device: auto, cpu, cuda:N, mps.
    #[arg(long)]
    device: Option<String>,

    /// Model input size (width height).
    #[arg(long, num_args = 2, value_names = ["WIDTH", "HEIGHT"])]
    imgsz: Option<Vec<u32>>,

    /// Frame queue and result queue capacity.
    #[arg(long)]
    queue_size: Option<usize>,

    /// What a full queue does with new items: drop or block.
    #[arg(long)]
    overflow: Option<OverflowPolicy>,

    /// Log progress every N frames (0 disables).
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Redis server host.
    #[arg(long)]
    redis_host: Option<String>,

    /// Redis port.
    #[arg(long)]
    redis_port: Option<u16>,

    /// Redis database number.
    #[arg(long)]
    redis_db: Option<i64>,

    /// Redis password.
    #[arg(long)]
    redis_password: Option<String>,

    /// Disable metadata publishing.
    #[arg(long, alias = "disable-metadata")]
    disable_redis: bool,

    /// RTMP endpoint for the annotated stream (enables streaming).
    #[arg(long)]
    stream_url: Option<String>,

    /// Disable streaming even if configured.
    #[arg(long)]
    disable_stream: bool,
}

impl Args {
    fn apply(&self, cfg: &mut RelayConfig) -> Result<()> {
        if let Some(model) = &self.model {
            cfg.detector.model = model.clone();
        }
        if let Some(source) = &self.source {
            cfg.source.uri = source.clone();
        }
        if let Some(conf) = self.conf {
            cfg.detector.confidence = conf;
        }
        if let Some(iou) = self.iou {
            cfg.detector.iou = iou;
        }
        if let Some(device) = &self.device {
            cfg.detector.device = device.clone();
        }
        if let Some(size) = &self.imgsz {
            match size.as_slice() {
                [width, height] => {
                    cfg.detector.input_width = *width;
                    cfg.detector.input_height = *height;
                }
                _ => return Err(anyhow!("--imgsz takes WIDTH HEIGHT")),
            }
        }
        if let Some(capacity) = self.queue_size {
            cfg.pipeline.frame_queue_capacity = capacity;
            cfg.pipeline.result_queue_capacity = capacity;
        }
        if let Some(policy) = self.overflow {
            cfg.pipeline.overflow = policy;
        }
        if let Some(interval) = self.stats_interval {
            cfg.pipeline.stats_interval = interval;
        }
        if let Some(host) = &self.redis_host {
            cfg.metadata.host = host.clone();
        }
        if let Some(port) = self.redis_port {
            cfg.metadata.port = port;
        }
        if let Some(db) = self.redis_db {
            cfg.metadata.db = db;
        }
        if let Some(password) = &self.redis_password {
            cfg.metadata.password = Some(password.clone()).filter(|p| !p.is_empty());
        }
        if self.disable_redis {
            cfg.metadata.enabled = false;
        }
        if let Some(url) = &self.stream_url {
            cfg.stream.url = url.clone();
            cfg.stream.enabled = true;
        }
        if self.disable_stream {
            cfg.stream.enabled = false;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = RelayConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg)?;
    cfg.validate()?;

    let stop = StopToken::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        if handler_stop.cancel() {
            log::info!("shutdown signal received, stopping pipeline...");
        }
    })
    .expect("error setting Ctrl-C handler");

    // both are fatal to startup
    let source = open_source(&cfg.source)?;
    let detector = open_backend(&cfg.detector)?;
    log::info!(
        "detector {} on {} (conf {}, iou {})",
        detector.name(),
        detector.device(),
        cfg.detector.confidence,
        cfg.detector.iou
    );

    let params = DetectParams {
        confidence_threshold: cfg.detector.confidence,
        iou_threshold: cfg.detector.iou,
    };
    let mut coordinator = Coordinator::new(cfg.pipeline.clone(), params, stop);

    if cfg.metadata.enabled {
        coordinator = coordinator.with_metadata(MetadataPublisher::connect(&cfg.metadata));
    } else {
        log::info!("metadata publishing disabled");
    }
    if cfg.stream.enabled {
        log::info!("streaming annotated video to {}", cfg.stream.url);
        coordinator = coordinator.with_stream(StreamSink::new(&cfg.stream));
    }

    let summary = coordinator.run(source, detector)?;
    println!(
        "frames: {}  detections: {}  dropped: {}  elapsed: {:.1}s  avg fps: {:.2}",
        summary.frames_processed,
        summary.detections_total,
        summary.frames_dropped(),
        summary.elapsed.as_secs_f64(),
        summary.fps
    );
    println!(
        "metadata records: {} written, {} live  publish failures: {}",
        summary.metadata_records_written, summary.metadata_records_live, summary.publish_failures
    );

    let failure = [
        summary.capture.as_ref().map(|r| &r.exit),
        summary.inference.as_ref().map(|r| &r.exit),
    ]
    .into_iter()
    .flatten()
    .find_map(|exit| match exit {
        StageExit::Failed(reason) => Some(reason.clone()),
        _ => None,
    });
    if let Some(reason) = failure {
        return Err(anyhow!("pipeline stopped on stage failure: {}", reason));
    }
    Ok(())
}
