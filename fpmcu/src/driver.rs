//! Sensor driver
//!
//! [`McuSensor`] turns the raw command channel into sensor operations:
//! mode control, frame/template transfer, per-user context switching,
//! entropy provisioning and firmware introspection. It is a stateless
//! facade over the device except for the negotiated transfer sizes, the
//! cached sensor info and the per-process command-version cache.
//!
//! [`SensorDriver`] is the capability interface the session manager is
//! built against; tests inject a fake implementing the same contract.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use fpmcu_core::{
    command::query_cmd_versions, AsyncHostCommand, ControlChannel, EcResult, HostCommand,
    ModeBits, Opcode, SensorMode, MAX_IO_ATTEMPTS,
};
use fpmcu_types::{EcImage, EcVersion, FpStats, SensorInfo, VendorTemplate};

use crate::error::{Error, Result};
use crate::telemetry::SharedTelemetry;

/// Frame index of the raw finger image; template slots start right after.
pub const FRAME_INDEX_RAW_IMAGE: usize = 0;
pub const FRAME_INDEX_TEMPLATE: usize = 1;

const FRAME_INDEX_SHIFT: u32 = 28;
const FRAME_OFFSET_MASK: u32 = 0x0FFF_FFFF;

/// Set on the size field of the final template chunk to commit the slot.
const TEMPLATE_COMMIT: u32 = 0x8000_0000;

/// Offset and size words preceding the data in each template chunk.
const TEMPLATE_PARAMS_HEADER: usize = 8;

// The MCU rate-limits frame reads right after boot; the first chunk gets
// a bounded wait loop.
const FRAME_BUSY_RETRIES: u32 = 50;
const FRAME_RETRY_DELAY: Duration = Duration::from_millis(100);

const BOOT_WAIT_TRIES: u32 = 50;
const BOOT_POLL_DELAY: Duration = Duration::from_millis(100);
const BOOT_FAIL_DELAY: Duration = Duration::from_millis(500);
// The MCU jumps from RO to RW on its own one second after boot; wait it
// out before checking which image is live.
const BOOT_SETTLE_DELAY: Duration = Duration::from_secs(3);

// Host packet headers eat into the negotiated packet sizes.
const HOST_REQUEST_HEADER: usize = 8;
const HOST_RESPONSE_HEADER: usize = 8;
// Size the MCU misreports for requests; subtracted until fixed firmware.
const REQUEST_SIZE_SLACK: usize = 4;

// add-entropy sub-actions
const ADD_ENTROPY_ASYNC: u8 = 0;
const ADD_ENTROPY_RESET_ASYNC: u8 = 1;
const ADD_ENTROPY_GET_RESULT: u8 = 2;

const RWSIG_ACTION_ABORT: u32 = 1;

// set-context sub-actions (v1, asynchronous form)
const CONTEXT_SET_ASYNC: u8 = 0;
const CONTEXT_GET_RESULT: u8 = 1;

/// User-id field lengths of the two context command wire formats.
const CONTEXT_USER_LEN_V0: usize = 32;
const CONTEXT_USER_LEN_V1: usize = 64;

const GET_VERSION_RESPONSE_LEN: usize = 100;
const FP_INFO_RESPONSE_LEN: usize = 48;
const FP_STATS_RESPONSE_LEN: usize = 22;
const FP_MODE_RESPONSE_LEN: usize = 4;
const PROTOCOL_INFO_RESPONSE_LEN: usize = 12;
const ROLLBACK_INFO_RESPONSE_LEN: usize = 12;
const MATCH_SECRET_LEN: usize = 32;

const FPSTATS_CAPTURE_INVALID: u8 = 1 << 0;
const FPSTATS_MATCHING_INVALID: u8 = 1 << 1;

/// Sensor operations the session manager depends on.
#[async_trait]
pub trait SensorDriver: Send {
    /// Set the device-wide operating mode.
    async fn set_mode(&mut self, mode: SensorMode) -> Result<()>;

    /// Query the current operating mode without changing it.
    async fn get_mode(&mut self) -> Result<SensorMode>;

    /// Read the template stored in `slot`.
    async fn get_template(&mut self, slot: usize) -> Result<VendorTemplate>;

    /// Read the just-enrolled template (highest valid slot, which must
    /// be dirty).
    async fn get_last_template(&mut self) -> Result<VendorTemplate>;

    /// Upload a template into the device's staging slot.
    async fn upload_template(&mut self, template: &VendorTemplate) -> Result<()>;

    /// Select the per-user secret scope.
    async fn set_context(&mut self, user_id_hex: &str) -> Result<()>;

    /// Clear the secret scope.
    async fn reset_context(&mut self) -> Result<()>;

    /// Slots modified by on-device adaptive matching since last checked.
    async fn get_dirty_map(&mut self) -> Result<Vec<usize>>;

    /// Capture/match timing of the last operation, `None` when the
    /// device flags the timestamps invalid.
    async fn get_stats(&mut self) -> Result<Option<FpStats>>;

    /// Read the per-record secret for a slot.
    async fn positive_match_secret(&mut self, slot: usize) -> Result<Vec<u8>>;

    fn max_template_count(&self) -> usize;

    fn template_version(&self) -> u32;

    /// Whether the firmware implements positive-match secrets. When it
    /// does not, match results are trusted as reported.
    fn supports_positive_match_secret(&self) -> bool;
}

/// Driver for the real MCU behind a [`ControlChannel`].
pub struct McuSensor<C> {
    chan: C,
    telemetry: SharedTelemetry,
    max_read_size: usize,
    max_write_size: usize,
    info: SensorInfo,
    /// Per-process cache of command-version negotiation answers.
    cmd_versions: HashMap<(Opcode, u8), bool>,
    supports_match_secret: bool,
}

impl<C: ControlChannel> McuSensor<C> {
    /// Open the sensor: negotiate transfer sizes, ensure the entropy
    /// secret is provisioned, clear any leftover context from an
    /// aborted session and read the sensor parameters.
    pub async fn open(chan: C, telemetry: SharedTelemetry) -> Result<Self> {
        let mut sensor = Self {
            chan,
            telemetry,
            max_read_size: 0,
            max_write_size: 0,
            info: SensorInfo::default(),
            cmd_versions: HashMap::new(),
            supports_match_secret: false,
        };

        sensor.ec_proto_info().await?;
        sensor.init_entropy(false).await?;

        // Clean MCU memory if anything remains from aborted sessions.
        sensor.reset_context().await?;

        sensor.update_info().await?;
        sensor.log_info();

        sensor.supports_match_secret = sensor
            .command_version_supported(Opcode::FpReadMatchSecret, 0)
            .await?;

        Ok(sensor)
    }

    /// Read max request/response sizes from the MCU. Known to hit a
    /// spurious transport timeout on first attempt, hence the retry.
    async fn ec_proto_info(&mut self) -> Result<()> {
        let mut cmd =
            HostCommand::with_request(Opcode::GetProtocolInfo, 0, Bytes::new(), PROTOCOL_INFO_RESPONSE_LEN);
        cmd.run_with_attempts(&mut self.chan, MAX_IO_ATTEMPTS).await?;

        let mut resp = cmd.response().clone();
        let _protocol_versions = resp.get_u32_le();
        let max_request = resp.get_u16_le() as usize;
        let max_response = resp.get_u16_le() as usize;

        self.max_read_size = max_response - HOST_RESPONSE_HEADER;
        self.max_write_size = max_request - HOST_REQUEST_HEADER - REQUEST_SIZE_SLACK;
        debug!(
            max_read = self.max_read_size,
            max_write = self.max_write_size,
            "negotiated packet sizes"
        );
        Ok(())
    }

    async fn update_info(&mut self) -> Result<()> {
        let mut cmd = HostCommand::with_request(Opcode::FpInfo, 1, Bytes::new(), FP_INFO_RESPONSE_LEN);
        cmd.run(&mut self.chan).await?;

        let mut r = cmd.response().clone();
        self.info = SensorInfo {
            vendor_id: r.get_u32_le(),
            product_id: r.get_u32_le(),
            model_id: r.get_u32_le(),
            version: r.get_u32_le(),
            frame_size: r.get_u32_le(),
            pixel_format: r.get_u32_le(),
            width: r.get_u16_le(),
            height: r.get_u16_le(),
            bpp: r.get_u16_le(),
            errors: r.get_u16_le() as u32,
            template_size: r.get_u32_le(),
            template_max: r.get_u16_le(),
            template_valid: r.get_u16_le(),
            template_dirty: r.get_u32_le(),
            template_version: r.get_u32_le(),
        };
        Ok(())
    }

    fn log_info(&self) {
        let i = &self.info;
        info!(
            vendor = format!("0x{:08X}", i.vendor_id),
            product = i.product_id,
            model = format!("0x{:X}", i.model_id),
            version = i.version,
            errors = format!("0x{:04X}", i.errors),
            "sensor info"
        );
        info!(
            frame_size = i.frame_size,
            width = i.width,
            height = i.height,
            bpp = i.bpp,
            "image info"
        );
        info!(
            template_version = i.template_version,
            template_size = i.template_size,
            template_max = i.template_max,
            "template info"
        );
    }

    /// Live sensor parameters from the last info refresh.
    pub fn info(&self) -> &SensorInfo {
        &self.info
    }

    /// Ask whether the device supports `version` of `opcode`, caching
    /// the answer for the process lifetime.
    pub async fn command_version_supported(&mut self, opcode: Opcode, version: u8) -> Result<bool> {
        if let Some(&known) = self.cmd_versions.get(&(opcode, version)) {
            return Ok(known);
        }
        let supported = match query_cmd_versions(&mut self.chan, opcode).await? {
            Some(mask) => mask & (1 << version) != 0,
            None => false,
        };
        debug!(%opcode, version, supported, "command version negotiated");
        self.cmd_versions.insert((opcode, version), supported);
        Ok(supported)
    }

    /// Firmware versions and active image as reported by the device.
    pub async fn get_version(&mut self) -> Result<EcVersion> {
        let mut cmd =
            HostCommand::with_request(Opcode::GetVersion, 0, Bytes::new(), GET_VERSION_RESPONSE_LEN);
        cmd.run_with_attempts(&mut self.chan, MAX_IO_ATTEMPTS).await?;

        let resp = cmd.response();
        let ro_version = nul_terminated(&resp[..32]);
        let rw_version = nul_terminated(&resp[32..64]);
        let mut image_raw = [0u8; 4];
        image_raw.copy_from_slice(&resp[96..100]);
        let current_image = EcImage::from_raw(u32::from_le_bytes(image_raw));
        Ok(EcVersion {
            ro_version,
            rw_version,
            current_image,
        })
    }

    /// Transfer one frame (raw image or template) in chunks bounded by
    /// the negotiated max read size.
    async fn fp_frame(&mut self, index: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut offset = (index as u32) << FRAME_INDEX_SHIFT;
        let mut cmd = HostCommand::new(Opcode::FpFrame, 0);

        let mut pos = 0usize;
        while pos < len {
            let chunk = self.max_read_size.min(len - pos);
            let mut req = BytesMut::with_capacity(8);
            req.put_u32_le(offset);
            req.put_u32_le(chunk as u32);
            cmd.set_request(req.freeze());
            cmd.set_response_len(chunk);

            let mut retries = 0;
            loop {
                match cmd.run(&mut self.chan).await {
                    Ok(()) => break,
                    Err(err) => {
                        // On the first chunk the MCU may still be
                        // rate-limiting after boot; wait it out.
                        if offset & FRAME_OFFSET_MASK == 0
                            && err.device_result() == Some(EcResult::Busy)
                            && retries < FRAME_BUSY_RETRIES
                        {
                            retries += 1;
                            info!(retries, "sensor busy, retrying frame read");
                            sleep(FRAME_RETRY_DELAY).await;
                            continue;
                        }
                        error!(offset = format!("0x{offset:X}"), "frame transfer failed");
                        return Err(err.into());
                    }
                }
            }

            out[pos..pos + chunk].copy_from_slice(cmd.response());
            offset += chunk as u32;
            pos += chunk;
        }
        Ok(out)
    }

    /// Read the raw finger image.
    pub async fn get_image(&mut self) -> Result<Vec<u8>> {
        let len = self.info.frame_size as usize;
        self.fp_frame(FRAME_INDEX_RAW_IMAGE, len).await
    }

    async fn rollback_block_id(&mut self) -> Result<i32> {
        let mut cmd =
            HostCommand::with_request(Opcode::RollbackInfo, 0, Bytes::new(), ROLLBACK_INFO_RESPONSE_LEN);
        cmd.run(&mut self.chan).await?;
        let mut resp = cmd.response().clone();
        Ok(resp.get_i32_le())
    }

    /// Reboot the MCU and wait until it runs `to_image`.
    pub async fn reboot(&mut self, to_image: EcImage) -> Result<()> {
        debug_assert!(to_image != EcImage::Unknown);

        let mut cmd = HostCommand::new(Opcode::Reboot, 0);
        // No reply expected: the MCU reboots under us.
        let _ = cmd.run(&mut self.chan).await;

        self.wait_on_boot(EcImage::Ro).await?;

        if to_image == EcImage::Ro {
            // Tell the MCU to stay in RO instead of jumping to RW.
            let mut req = BytesMut::with_capacity(4);
            req.put_u32_le(RWSIG_ACTION_ABORT);
            let mut rwsig = HostCommand::with_request(Opcode::RwsigAction, 0, req.freeze(), 0);
            rwsig.run(&mut self.chan).await?;
        }

        sleep(BOOT_SETTLE_DELAY).await;

        self.wait_on_boot(to_image).await
    }

    async fn wait_on_boot(&mut self, expected: EcImage) -> Result<()> {
        let mut image = EcImage::Unknown;
        for _ in 0..BOOT_WAIT_TRIES {
            match self.get_version().await {
                Ok(version) => {
                    image = version.current_image;
                    if image == expected {
                        info!(%image, "MCU image is up");
                        return Ok(());
                    }
                    sleep(BOOT_POLL_DELAY).await;
                }
                Err(err) => {
                    warn!(%err, "failed to query firmware version during boot wait");
                    sleep(BOOT_FAIL_DELAY).await;
                }
            }
        }
        error!(%image, %expected, "MCU rebooted into the wrong image");
        Err(Error::Core(fpmcu_core::Error::Timeout))
    }

    async fn add_entropy(&mut self, reset: bool) -> Result<()> {
        let action = if reset {
            ADD_ENTROPY_RESET_ASYNC
        } else {
            ADD_ENTROPY_ASYNC
        };
        let cmd = HostCommand::with_request(Opcode::AddEntropy, 0, vec![action], 0);
        // The MCU answers busy until the rollback block is rewritten.
        let mut async_cmd = AsyncHostCommand::new(cmd, vec![ADD_ENTROPY_GET_RESULT]);
        async_cmd.run(&mut self.chan).await?;
        info!("entropy has been added");
        Ok(())
    }

    /// Run the full provisioning sequence: reboot to RO, add entropy,
    /// reboot back to RW, verify the rollback block advanced.
    async fn update_entropy(&mut self, reset: bool) -> Result<()> {
        let block_id = self.rollback_block_id().await?;

        self.reboot(EcImage::Ro).await?;
        self.add_entropy(reset).await?;
        self.reboot(EcImage::Rw).await?;

        let new_block_id = self.rollback_block_id().await?;
        let expected_delta = if reset { 2 } else { 1 };
        if new_block_id != block_id + expected_delta {
            error!(
                block_id,
                new_block_id, "entropy source has not been updated"
            );
            return Err(Error::Core(fpmcu_core::Error::Device {
                opcode: Opcode::AddEntropy,
                result: EcResult::Error,
            }));
        }
        Ok(())
    }

    /// Ensure a device secret is provisioned exactly once, unless
    /// `reset` asks for a fresh one.
    pub async fn init_entropy(&mut self, reset: bool) -> Result<()> {
        let block_id = self.rollback_block_id().await?;
        if !reset && block_id != 0 {
            info!("entropy source had been initialized previously");
            return Ok(());
        }
        info!("entropy source has not been initialized yet");
        self.update_entropy(reset).await
    }

    fn context_payload(user_id_hex: &str, user_len: usize) -> Result<Vec<u8>> {
        let mut user = vec![0u8; user_len];
        if !user_id_hex.is_empty() {
            let decoded = hex::decode(user_id_hex)
                .map_err(|_| Error::InvalidUserId(user_id_hex.to_string()))?;
            let n = decoded.len().min(user_len);
            user[..n].copy_from_slice(&decoded[..n]);
        }
        Ok(user)
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[async_trait]
impl<C: ControlChannel> SensorDriver for McuSensor<C> {
    async fn set_mode(&mut self, mode: SensorMode) -> Result<()> {
        let raw = mode.to_raw().ok_or(Error::UnencodableMode(mode))?;
        let mut req = BytesMut::with_capacity(4);
        req.put_u32_le(raw);
        let mut cmd =
            HostCommand::with_request(Opcode::FpMode, 0, req.freeze(), FP_MODE_RESPONSE_LEN);

        let err = match cmd.run(&mut self.chan).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        // The host and MCU can race across a suspend boundary: the set
        // goes through but its acknowledgment times out. If the mode
        // reads back as requested, the set worked.
        let cur_mode = self.get_mode().await.map_err(|get_err| {
            error!(%get_err, "failed to read mode back while verifying a failed set");
            get_err
        })?;
        if cur_mode == mode {
            warn!(%mode, "mode set command failed but the mode was applied");
            return Ok(());
        }
        error!(requested = %mode, current = %cur_mode, "failed to set sensor mode");
        Err(err.into())
    }

    async fn get_mode(&mut self) -> Result<SensorMode> {
        let mut req = BytesMut::with_capacity(4);
        req.put_u32_le(ModeBits::DONT_CHANGE.bits());
        let mut cmd =
            HostCommand::with_request(Opcode::FpMode, 0, req.freeze(), FP_MODE_RESPONSE_LEN);
        cmd.run(&mut self.chan).await?;

        let mut resp = cmd.response().clone();
        Ok(SensorMode::from_raw(resp.get_u32_le()))
    }

    async fn get_template(&mut self, slot: usize) -> Result<VendorTemplate> {
        // Refresh the valid count; uploads since the last query moved it.
        self.update_info().await?;
        let valid = self.info.template_valid as usize;
        if slot >= valid {
            return Err(Error::InvalidSlot { slot, valid });
        }
        let len = self.info.template_size as usize;
        let data = self.fp_frame(slot + FRAME_INDEX_TEMPLATE, len).await?;
        Ok(VendorTemplate::new(data))
    }

    async fn get_last_template(&mut self) -> Result<VendorTemplate> {
        // Refresh the valid count and dirty bitmap first.
        self.update_info().await?;
        if self.info.template_valid == 0 {
            return Err(Error::NoNewTemplate);
        }
        let slot = (self.info.template_valid - 1) as usize;
        // The last slot must be freshly written, or there is nothing new.
        if self.info.template_dirty & (1 << slot) == 0 {
            return Err(Error::NoNewTemplate);
        }
        let len = self.info.template_size as usize;
        let data = self.fp_frame(slot + FRAME_INDEX_TEMPLATE, len).await?;
        Ok(VendorTemplate::new(data))
    }

    async fn upload_template(&mut self, template: &VendorTemplate) -> Result<()> {
        let data = template.as_bytes();
        let max_chunk = self.max_write_size - TEMPLATE_PARAMS_HEADER;
        let mut cmd = HostCommand::new(Opcode::FpTemplate, 0);

        let mut pos = 0usize;
        while pos < data.len() {
            let remaining = data.len() - pos;
            let chunk = max_chunk.min(remaining);
            // The final chunk asks the device to commit the slot.
            let size_field = chunk as u32 | if remaining == chunk { TEMPLATE_COMMIT } else { 0 };

            let mut req = BytesMut::with_capacity(8 + chunk);
            req.put_u32_le(pos as u32);
            req.put_u32_le(size_field);
            req.put_slice(&data[pos..pos + chunk]);
            cmd.set_request(req.freeze());

            if let Err(err) = cmd.run(&mut self.chan).await {
                // The staging slot is undefined now; the caller must not
                // assume partial success.
                error!(offset = pos, "template upload failed");
                return Err(err.into());
            }
            pos += chunk;
        }
        Ok(())
    }

    async fn set_context(&mut self, user_id_hex: &str) -> Result<()> {
        // Prefer the newer asynchronous wire format when the firmware
        // has it; fall back to the original synchronous one.
        if self.command_version_supported(Opcode::FpContext, 1).await? {
            let mut payload = Vec::with_capacity(4 + CONTEXT_USER_LEN_V1);
            payload.push(CONTEXT_SET_ASYNC);
            payload.extend_from_slice(&[0u8; 3]);
            payload.extend_from_slice(&Self::context_payload(user_id_hex, CONTEXT_USER_LEN_V1)?);

            let mut poll = vec![0u8; 4 + CONTEXT_USER_LEN_V1];
            poll[0] = CONTEXT_GET_RESULT;

            let cmd = HostCommand::with_request(Opcode::FpContext, 1, payload, 0);
            let mut async_cmd = AsyncHostCommand::new(cmd, poll).strict();
            async_cmd.run(&mut self.chan).await?;
        } else {
            let payload = Self::context_payload(user_id_hex, CONTEXT_USER_LEN_V0)?;
            let mut cmd = HostCommand::with_request(Opcode::FpContext, 0, payload, 0);
            cmd.run(&mut self.chan).await?;
        }
        Ok(())
    }

    async fn reset_context(&mut self) -> Result<()> {
        let cur_mode = match self.get_mode().await {
            Ok(mode) => mode,
            Err(err) => {
                error!(%err, "unable to get mode before context reset");
                SensorMode::Invalid
            }
        };

        // A context reset must only happen once no session is running.
        // Seeing a session mode here is a cleanup bug upstream; report
        // it, but do not fail the reset.
        if cur_mode != SensorMode::None {
            error!(mode = %cur_mode, "resetting context while sensor is active");
        }
        self.telemetry.reset_context_mode(cur_mode);

        self.set_context("").await
    }

    async fn get_dirty_map(&mut self) -> Result<Vec<usize>> {
        // Retrieve the up-to-date bitmap from the MCU.
        self.update_info().await?;
        Ok(self.info.dirty_list())
    }

    async fn get_stats(&mut self) -> Result<Option<FpStats>> {
        let mut cmd = HostCommand::with_request(Opcode::FpStats, 0, Bytes::new(), FP_STATS_RESPONSE_LEN);
        cmd.run(&mut self.chan).await?;

        let mut r = cmd.response().clone();
        let capture_us = r.get_u32_le();
        let matcher_us = r.get_u32_le();
        let overall_us = r.get_u32_le();
        r.advance(8); // overall start timestamp, unused here
        let invalid = r.get_u8();

        if invalid & (FPSTATS_CAPTURE_INVALID | FPSTATS_MATCHING_INVALID) != 0 {
            return Ok(None);
        }
        Ok(Some(FpStats {
            capture_ms: capture_us / 1000,
            matcher_ms: matcher_us / 1000,
            overall_ms: overall_us / 1000,
        }))
    }

    async fn positive_match_secret(&mut self, slot: usize) -> Result<Vec<u8>> {
        if !self.supports_match_secret {
            return Err(Error::SecretUnsupported);
        }
        let mut req = BytesMut::with_capacity(2);
        req.put_u16_le(slot as u16);
        let mut cmd =
            HostCommand::with_request(Opcode::FpReadMatchSecret, 0, req.freeze(), MATCH_SECRET_LEN);
        cmd.run(&mut self.chan).await?;
        Ok(cmd.response().to_vec())
    }

    fn max_template_count(&self) -> usize {
        self.info.template_max as usize
    }

    fn template_version(&self) -> u32 {
        self.info.template_version
    }

    fn supports_positive_match_secret(&self) -> bool {
        self.supports_match_secret
    }
}
