//! Runner fleet management.

mod controller;
mod logmux;

pub use controller::{
    FleetConfig, FleetController, RunnerHandle, RunnerStatus, FLEET_LABEL, GROUP_LABEL,
    RUNNER_IMAGE_PATTERN, TOKEN_ENV,
};
pub use logmux::{format_line, LogStreamer};
