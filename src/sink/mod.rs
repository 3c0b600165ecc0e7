//! Side-effecting consumers of inference results.
//!
//! Both sinks are best-effort: their failures are logged and absorbed here and
//! never reach the pipeline as errors.

pub mod health;
pub mod metadata;
pub mod store;
pub mod stream;

pub use health::{RecoveryAction, SinkHealth, SinkState};
pub use metadata::{parse_notification, MetadataPublisher, MetadataRecord};
pub use store::{MemoryStore, MetadataStore, RedisStore, StoredRecord};
pub use stream::{EncoderCommand, StreamSink, StreamState};
