//! Fan-in of camera snapshots into per-marker pose queues.

pub mod aggregator;
pub mod pose_history;
pub mod pose_queue;
pub mod service;

pub use aggregator::{Aggregator, TickReport};
pub use pose_history::{HISTORY_HEADER, PoseHistoryWriter, PoseRecord, PoseSink, QueuedPoseSink};
pub use pose_queue::{PoseQueue, geometric_weights};
pub use service::{AggregatorService, tick_once};
