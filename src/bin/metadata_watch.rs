//! metadata_watch - follow detection metadata as it is published
//!
//! Subscribes to the updates channel, reads each announced record and prints
//! it as one JSON line. Accepts notifications carrying the bare record key or
//! a JSON object with a `key` member.

use anyhow::{Context, Result};
use clap::Parser;
use redis::Commands;
use serde::Serialize;
use std::collections::HashMap;

use detection_relay::config::{MetadataSettings, RelayConfig};
use detection_relay::sink::metadata::parse_notification;
use detection_relay::sink::store::redis_url;
use detection_relay::sink::MetadataRecord;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print detection metadata records as they are published")]
struct Args {
    /// Redis server host.
    #[arg(long, env = "RELAY_REDIS_HOST")]
    redis_host: Option<String>,

    /// Redis port.
    #[arg(long, env = "RELAY_REDIS_PORT")]
    redis_port: Option<u16>,

    /// Redis database number.
    #[arg(long)]
    redis_db: Option<i64>,

    /// Redis password.
    #[arg(long, env = "RELAY_REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Updates channel to subscribe to.
    #[arg(long)]
    channel: Option<String>,

    /// Exit after this many records (runs until interrupted when absent).
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Serialize)]
struct RecordLine<'a> {
    key: &'a str,
    timestamp: u64,
    center_x: f32,
    center_y: f32,
    width: f32,
    height: f32,
    confidence: f64,
}

impl<'a> From<&'a MetadataRecord> for RecordLine<'a> {
    fn from(record: &'a MetadataRecord) -> Self {
        Self {
            key: &record.key,
            timestamp: record.timestamp_ms,
            center_x: record.center_x,
            center_y: record.center_y,
            width: record.width,
            height: record.height,
            confidence: record.confidence_pct,
        }
    }
}

fn settings(args: &Args) -> MetadataSettings {
    let mut settings = RelayConfig::default().metadata;
    if let Some(host) = &args.redis_host {
        settings.host = host.clone();
    }
    if let Some(port) = args.redis_port {
        settings.port = port;
    }
    if let Some(db) = args.redis_db {
        settings.db = db;
    }
    settings.password = args.redis_password.clone().filter(|p| !p.is_empty());
    if let Some(channel) = &args.channel {
        settings.channel = channel.clone();
    }
    settings
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let settings = settings(&args);

    let client = redis::Client::open(redis_url(&settings)?.as_str())
        .context("invalid redis connection info")?;
    let mut reader = client
        .get_connection_with_timeout(settings.connect_timeout)
        .with_context(|| {
            format!("failed to connect to redis at {}:{}", settings.host, settings.port)
        })?;
    let mut subscriber = client
        .get_connection_with_timeout(settings.connect_timeout)
        .context("failed to open subscriber connection")?;

    let mut pubsub = subscriber.as_pubsub();
    pubsub
        .subscribe(&settings.channel)
        .with_context(|| format!("failed to subscribe to {}", settings.channel))?;
    log::info!("listening on {}", settings.channel);

    let mut seen = 0u64;
    loop {
        let message = pubsub.get_message().context("subscription lost")?;
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("ignoring undecodable notification: {}", e);
                continue;
            }
        };
        let Some(key) = parse_notification(&payload) else {
            log::warn!("ignoring notification without a key: {}", payload);
            continue;
        };

        let fields: HashMap<String, String> = reader
            .hgetall(&key)
            .with_context(|| format!("failed to read {}", key))?;
        if fields.is_empty() {
            // expired between publish and read
            log::debug!("{} no longer exists", key);
            continue;
        }
        match MetadataRecord::from_fields(&key, &fields) {
            Ok(record) => println!("{}", serde_json::to_string(&RecordLine::from(&record))?),
            Err(e) => log::warn!("malformed record {}: {:#}", key, e),
        }

        seen += 1;
        if args.limit.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    Ok(())
}
