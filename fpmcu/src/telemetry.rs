//! Telemetry hook
//!
//! The metrics reporter lives outside this core; components hand it the
//! few data points it needs through this trait. Every hook is
//! best-effort and must never influence control flow.

use std::sync::Arc;

use fpmcu_core::SensorMode;
use fpmcu_types::FpStats;

use crate::updater::UpdateReason;

/// Sink for the data points the core emits.
pub trait Telemetry: Send + Sync {
    /// Mode observed when a context reset was issued. Anything but
    /// `None` here means a session was not cleaned up first.
    fn reset_context_mode(&self, _mode: SensorMode) {}

    /// Capture/match latency after an auth attempt.
    fn match_latency(&self, _matched: bool, _stats: FpStats) {}

    /// Why the firmware updater decided to flash.
    fn update_reason(&self, _reason: UpdateReason) {}
}

/// Discards every data point.
#[derive(Debug, Default)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {}

/// Shared handle components keep to the sink.
pub type SharedTelemetry = Arc<dyn Telemetry>;
