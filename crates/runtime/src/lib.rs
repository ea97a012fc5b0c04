pub mod metrics;
pub mod perf;
pub mod quality;

pub use metrics::*;
pub use perf::*;
pub use quality::*;
