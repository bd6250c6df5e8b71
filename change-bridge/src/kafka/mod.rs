pub mod config;
pub mod dead_letter;
pub mod offset_tracker;
pub mod source;
pub mod types;

pub use config::{producer_config, ConsumerConfigBuilder, TlsFiles};
pub use dead_letter::KafkaDeadLetterReporter;
pub use offset_tracker::OffsetTracker;
pub use source::{ChangeSource, KafkaSource};
pub use types::{Partition, PartitionProgress, SourceMessage};
