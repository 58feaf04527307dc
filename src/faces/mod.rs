pub mod consolidation;
pub mod detector;
pub mod matching;
pub mod processor;
pub mod simulated;
pub mod tracker;

pub use consolidation::{consolidate, Consolidation};
pub use detector::{Detector, ReferenceError, ReferenceSource, VideoSource};
pub use processor::FrameProcessor;
pub use simulated::SimulatedDetector;
