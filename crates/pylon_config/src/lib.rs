mod limits;
mod pylon;
mod timeouts;
mod upstream;
mod validation;

pub use limits::LimitsConfig;
pub use pylon::{ConfigError, PylonConfig, DEFAULT_METRICS_LISTEN};
pub use timeouts::TimeoutsConfig;
pub use upstream::UpstreamConfig;
pub use validation::ConfigReport;
