//! Service modules for the cycle-correlation pipeline

pub mod cycle_segmenter;
pub mod inspection_resolver;
pub mod monitor;
pub mod photo_correlator;
pub mod snapshot_ingestor;
pub mod stats_updater;

pub use cycle_segmenter::{Cycle, CycleRow, CycleSegmenter, Segmentation};
pub use inspection_resolver::{InspectionResolver, Resolution};
pub use monitor::{CycleMonitor, TickSummary};
pub use photo_correlator::{PhotoCorrelator, StagedPhoto, SweepOutcome};
pub use snapshot_ingestor::{IngestOutcome, IngestStats, SnapshotIngestor};
