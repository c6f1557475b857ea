pub mod mode;
pub mod readiness;

pub use mode::{BootstrapPlan, ConfigError, resolve};
pub use readiness::{Readiness, ReadinessPolicy, ReadinessWatcher};
