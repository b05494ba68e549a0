pub mod pipeline;
pub mod processor;
pub mod telemetry;

// Re-export main types
pub use pipeline::Pipeline;
pub use processor::{Line, TextStats, TextStatsProcessor};
pub use telemetry::{init_telemetry, TelemetryConfig};
