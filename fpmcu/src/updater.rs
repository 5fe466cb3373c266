//! Firmware update decision and flashing
//!
//! Runs once at boot, before the daemon starts serving sessions. The
//! decision is a pure function of the live device versions, the flash
//! protection state and the packaged image; the flashing procedure
//! drives two external collaborators (the flasher and the boot UI) and
//! must never leave the device in a state that boot-loops.

use async_trait::async_trait;
use bitflags::bitflags;
use tracing::{error, info, warn};

use fpmcu_types::{EcImage, EcVersion};

use crate::error::Result;
use crate::firmware::FirmwareImage;
use crate::telemetry::SharedTelemetry;

bitflags! {
    /// Why an update was performed, as surfaced to telemetry.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct UpdateReason: u32 {
        const MISMATCH_RO_VERSION = 1 << 0;
        const MISMATCH_RW_VERSION = 1 << 1;
        const ACTIVE_IMAGE_RO     = 1 << 2;
    }
}

/// Outcome of one updater run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    NotNecessary,
    Succeeded,
    Failed,
}

/// What the updater decided to flash, and why.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UpdateDecision {
    pub ro: bool,
    pub rw: bool,
    pub reason: UpdateReason,
}

impl UpdateDecision {
    pub fn update_needed(&self) -> bool {
        self.ro || self.rw
    }
}

/// Device-side operations the updater needs.
#[async_trait]
pub trait DeviceUpdate: Send {
    /// Live firmware versions and active image.
    async fn version(&mut self) -> Result<EcVersion>;

    /// Whether hardware write protection covers the RO partition.
    async fn flash_protect_enabled(&mut self) -> Result<bool>;

    /// Flash one image partition from the packaged file.
    async fn flash(&mut self, image: &FirmwareImage, target: EcImage) -> Result<()>;
}

/// Boot-time UI and reboot scheduling. Both calls are advisory.
#[async_trait]
pub trait BootCtrl: Send {
    /// Show the "update in progress" splash.
    async fn trigger_update_splash(&mut self) -> Result<()>;

    /// Drop the marker that reboots the system after the update.
    async fn schedule_reboot(&mut self) -> Result<()>;
}

/// Decide which partitions need flashing.
///
/// RO is flashed only when flash protection is disabled, and always
/// before RW: re-keying and non-forward-compatible changes must go
/// through RO. RW is flashed when the device is not running it (it fell
/// back to RO) or when the packaged version differs.
pub fn decide_update(
    device: &EcVersion,
    flash_protect_enabled: bool,
    image: &FirmwareImage,
) -> UpdateDecision {
    let mut reason = UpdateReason::empty();

    let ro_mismatch = device.ro_version != image.ro_version();
    let rw_mismatch = device.rw_version != image.rw_version();

    let ro = !flash_protect_enabled && ro_mismatch;
    if ro {
        reason |= UpdateReason::MISMATCH_RO_VERSION;
    }

    let mut rw = false;
    if device.current_image != EcImage::Rw {
        rw = true;
        reason |= UpdateReason::ACTIVE_IMAGE_RO;
    }
    if rw_mismatch {
        rw = true;
        reason |= UpdateReason::MISMATCH_RW_VERSION;
    }

    UpdateDecision { ro, rw, reason }
}

/// Run the whole update pass: decide, flash, schedule the reboot.
///
/// A failed flash aborts the run without scheduling a reboot, so a
/// device that never successfully updated cannot boot-loop.
pub async fn do_update(
    device: &mut dyn DeviceUpdate,
    boot_ctrl: &mut dyn BootCtrl,
    image: &FirmwareImage,
    telemetry: &SharedTelemetry,
) -> UpdateStatus {
    let version = match device.version().await {
        Ok(version) => version,
        Err(err) => {
            error!(%err, "failed to fetch device firmware version");
            return UpdateStatus::Failed;
        }
    };
    let flash_protect = match device.flash_protect_enabled().await {
        Ok(enabled) => enabled,
        Err(err) => {
            error!(%err, "failed to fetch flash protect status");
            return UpdateStatus::Failed;
        }
    };

    let decision = decide_update(&version, flash_protect, image);
    if !decision.update_needed() {
        info!(%version, "firmware is up to date");
        return UpdateStatus::NotNecessary;
    }
    info!(
        ro = decision.ro,
        rw = decision.rw,
        reason = format!("{:?}", decision.reason),
        "firmware update required"
    );
    telemetry.update_reason(decision.reason);

    // Advisory only; the update proceeds without the splash.
    if let Err(err) = boot_ctrl.trigger_update_splash().await {
        warn!(%err, "failed to trigger update splash");
    }

    if decision.ro {
        info!(version = image.ro_version(), "flashing RO image");
        if let Err(err) = device.flash(image, EcImage::Ro).await {
            error!(%err, "RO flash failed, aborting update");
            return UpdateStatus::Failed;
        }
    }

    if decision.rw {
        info!(version = image.rw_version(), "flashing RW image");
        if let Err(err) = device.flash(image, EcImage::Rw).await {
            error!(%err, "RW flash failed, aborting update");
            return UpdateStatus::Failed;
        }
    }

    // Advisory as well: a missed reboot marker only delays the update
    // taking effect.
    if let Err(err) = boot_ctrl.schedule_reboot().await {
        warn!(%err, "failed to schedule reboot");
    }

    UpdateStatus::Succeeded
}
