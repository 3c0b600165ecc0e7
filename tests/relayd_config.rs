use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use detection_relay::config::RelayConfig;
use detection_relay::OverflowPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "RELAY_CONFIG",
        "RELAY_SOURCE",
        "RELAY_MODEL",
        "RELAY_DEVICE",
        "RELAY_REDIS_HOST",
        "RELAY_REDIS_PORT",
        "RELAY_REDIS_PASSWORD",
        "RELAY_STREAM_URL",
        "RELAY_DISABLE_METADATA",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "source": { "uri": "rtsp://camera-1/main", "width": 800, "height": 600, "fps": 15 },
        "detector": { "model": "weights/yolov8n.onnx", "confidence": 0.4, "iou": 0.6 },
        "pipeline": { "frame_queue_capacity": 4, "overflow": "block", "stats_interval": 50 },
        "metadata": { "host": "cache.internal", "key_prefix": "cam1_metadata", "ttl_secs": 600 },
        "stream": { "enabled": true, "url": "rtmp://media/live/cam1", "fps": 30 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_DEVICE", "cuda:1");
    std::env::set_var("RELAY_REDIS_PORT", "6380");
    std::env::set_var("RELAY_DISABLE_METADATA", "true");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.source.uri, "rtsp://camera-1/main");
    assert_eq!((cfg.source.width, cfg.source.height, cfg.source.fps), (800, 600, 15));
    assert_eq!(cfg.detector.model, "weights/yolov8n.onnx");
    assert_eq!(cfg.detector.device, "cuda:1");
    assert_eq!(cfg.detector.confidence, 0.4);
    assert_eq!(cfg.pipeline.frame_queue_capacity, 4);
    assert_eq!(cfg.pipeline.result_queue_capacity, 16);
    assert_eq!(cfg.pipeline.overflow, OverflowPolicy::Block);
    assert_eq!(cfg.pipeline.stats_interval, 50);
    assert_eq!(cfg.metadata.host, "cache.internal");
    assert_eq!(cfg.metadata.port, 6380);
    assert_eq!(cfg.metadata.key_prefix, "cam1_metadata");
    assert_eq!(cfg.metadata.channel, "image:metadata:updates");
    assert_eq!(cfg.metadata.ttl, Duration::from_secs(600));
    assert!(!cfg.metadata.enabled);
    assert!(cfg.stream.enabled);
    assert_eq!(cfg.stream.url, "rtmp://media/live/cam1");
    assert_eq!(cfg.stream.fps, 30);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [source]
        uri = "0"

        [detector]
        model = "stub"
        input_width = 640
        input_height = 640

        [metadata]
        password = "hunter2"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = RelayConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.source.uri, "0");
    assert_eq!(cfg.detector.model, "stub");
    assert_eq!((cfg.detector.input_width, cfg.detector.input_height), (640, 640));
    assert_eq!(cfg.metadata.password.as_deref(), Some("hunter2"));
    assert!(cfg.metadata.enabled);
    assert!(!cfg.stream.enabled);

    clear_env();
}

#[test]
fn stream_url_env_enables_streaming() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("RELAY_STREAM_URL", "rtmp://edge/live/key");
    let cfg = RelayConfig::load().expect("load config");
    assert!(cfg.stream.enabled);
    assert_eq!(cfg.stream.url, "rtmp://edge/live/key");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "detector": { "iou": 1.5 } }"#)
        .expect("write config");
    let err = RelayConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("iou"));

    std::env::set_var("RELAY_REDIS_PORT", "not-a-port");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_DISABLE_METADATA", "sometimes");
    assert!(RelayConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    assert!(RelayConfig::load_from(Some(file.path())).is_err());

    clear_env();
}
