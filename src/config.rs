// phantom-dspm-core/src/config.rs
// Ambient tuning knobs for the pipeline, classifier and collector. Loading
// these from a file or environment is an external concern (the platform's
// configuration layer); this module only owns the defaults and the types.

use std::time::Duration;

/// Queue capacities, worker pool sizes and timeouts for one scan pipeline
/// instance. Each running scan owns its own `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub asset_queue_capacity: usize,
    pub object_queue_capacity: usize,
    pub output_channel_capacity: usize,
    pub asset_workers: usize,
    pub classify_workers: usize,
    pub object_read_timeout: Duration,
    pub scan_wall_clock_ceiling: Duration,
    pub max_object_bytes: u64,
    pub streaming_threshold_bytes: u64,
    /// Overlap between successive windows of a streamed large object, kept
    /// comfortably above the longest built-in rule's plausible match length
    /// so a hit straddling a window boundary is never split and missed.
    pub stream_overlap_bytes: u64,
    pub classification_batch_size: usize,
    pub retry_attempts: u32,
    pub retry_backoff: [Duration; 2],
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            asset_queue_capacity: 256,
            object_queue_capacity: 1024,
            output_channel_capacity: 256,
            asset_workers: (2 * cores).min(8),
            classify_workers: 4 * cores,
            object_read_timeout: Duration::from_secs(30),
            scan_wall_clock_ceiling: Duration::from_secs(6 * 60 * 60),
            max_object_bytes: 10 * 1024 * 1024,
            streaming_threshold_bytes: 256 * 1024,
            stream_overlap_bytes: 4 * 1024,
            classification_batch_size: 1000,
            retry_attempts: 2,
            retry_backoff: [Duration::from_millis(250), Duration::from_secs(1)],
        }
    }
}

/// Tuning for the classifier's masking and reporting limits.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierConfig {
    pub sample_match_limit: usize,
    pub match_location_limit: usize,
    pub context_window_chars: usize,
    pub mask_visible_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sample_match_limit: 5,
            match_location_limit: 20,
            context_window_chars: 64,
            mask_visible_chars: 2,
        }
    }
}
