//! Enroll/authenticate session state machine
//!
//! The manager owns the in-memory record table (position == on-device
//! slot index), sequences hardware events into capture and match
//! pipelines, and persists templates through the storage collaborator.
//!
//! At most one session runs at a time, and at most one hardware action
//! is pending: events dispatch to whichever single pending action is
//! registered, which mirrors the hardware's own serialization. Ending a
//! session forces the sensor idle before dropping the pending action, so
//! a stray late event cannot be mistaken for a new session's event;
//! handles carry a generation counter so ending twice is a no-op.

use base64::prelude::*;
use tracing::{error, info, warn};

use fpmcu_core::{EnrollEvent, FpEvent, MatchEvent, SensorMode};
use fpmcu_types::{
    AttemptMatches, EnrollProgress, InternalRecord, ScanResult, VendorTemplate,
};

use crate::driver::SensorDriver;
use crate::error::{Error, Result};
use crate::secret::compute_validation_value;
use crate::storage::{RecordStorage, StoredRecord, RECORD_FORMAT_VERSION};
use crate::telemetry::SharedTelemetry;

/// Low-coverage match results are retried silently this many times
/// before a degraded-but-terminal result is surfaced. Covers the common
/// case of a finger still settling onto the sensor; 20 attempts is
/// roughly 5 to 15 seconds.
pub const MAX_PARTIAL_ATTEMPTS: u32 = 20;

/// Token identifying one started session. Ending a session through a
/// stale token is a no-op.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    generation: u64,
}

enum PendingAction {
    EnrollImage { record: InternalRecord },
    EnrollFingerUp { record: InternalRecord },
    Match { attempt: u32 },
    MatchFingerUp,
}

type EnrollScanDoneFn = Box<dyn FnMut(ScanResult, EnrollProgress) + Send>;
type AuthScanDoneFn = Box<dyn FnMut(ScanResult, AttemptMatches) + Send>;
type SessionFailedFn = Box<dyn FnMut() + Send>;

/// Session manager over a sensor driver and a record store.
pub struct SessionManager<D, S> {
    driver: D,
    storage: S,
    telemetry: SharedTelemetry,
    /// Position in this table is the on-device slot index.
    records: Vec<InternalRecord>,
    pending: Option<PendingAction>,
    generation: u64,
    session_live: bool,
    on_enroll_scan_done: Option<EnrollScanDoneFn>,
    on_auth_scan_done: Option<AuthScanDoneFn>,
    on_session_failed: Option<SessionFailedFn>,
}

impl<D: SensorDriver, S: RecordStorage> SessionManager<D, S> {
    pub fn new(driver: D, storage: S, telemetry: SharedTelemetry) -> Self {
        Self {
            driver,
            storage,
            telemetry,
            records: Vec::new(),
            pending: None,
            generation: 0,
            session_live: false,
            on_enroll_scan_done: None,
            on_auth_scan_done: None,
            on_session_failed: None,
        }
    }

    /// Register the enroll progress callback.
    pub fn on_enroll_scan_done(&mut self, f: impl FnMut(ScanResult, EnrollProgress) + Send + 'static) {
        self.on_enroll_scan_done = Some(Box::new(f));
    }

    /// Register the auth result callback.
    pub fn on_auth_scan_done(&mut self, f: impl FnMut(ScanResult, AttemptMatches) + Send + 'static) {
        self.on_auth_scan_done = Some(Box::new(f));
    }

    /// Register the terminal session-failure callback.
    pub fn on_session_failed(&mut self, f: impl FnMut() + Send + 'static) {
        self.on_session_failed = Some(Box::new(f));
    }

    /// Records currently bound to device slots, in slot order.
    pub fn records(&self) -> &[InternalRecord] {
        &self.records
    }

    /// Begin enrolling a new finger for `user_id`.
    ///
    /// Fails with no side effects when a session is already active or
    /// the device's slot table is full.
    pub async fn start_enroll(&mut self, user_id: &str, label: &str) -> Result<SessionHandle> {
        info!("start enroll session");
        if self.session_live || self.pending.is_some() {
            return Err(Error::SessionActive);
        }
        if self.records.len() >= self.driver.max_template_count() {
            error!("no space for an additional template");
            return Err(Error::NoSpace);
        }

        let record = InternalRecord {
            record_id: self.storage.generate_new_record_id(),
            user_id: user_id.to_string(),
            label: label.to_string(),
            validation_value: None,
        };
        self.request_enroll_image(record).await?;

        self.generation += 1;
        self.session_live = true;
        Ok(SessionHandle {
            generation: self.generation,
        })
    }

    /// Begin an authenticate session.
    pub async fn start_auth(&mut self) -> Result<SessionHandle> {
        info!("start auth session");
        if self.session_live || self.pending.is_some() {
            return Err(Error::SessionActive);
        }
        self.request_match(0).await?;

        self.generation += 1;
        self.session_live = true;
        Ok(SessionHandle {
            generation: self.generation,
        })
    }

    /// End the session identified by `handle`. Safe to call at any time;
    /// ending an already-ended session is a no-op.
    pub async fn end_session(&mut self, handle: SessionHandle) {
        if !self.session_live || handle.generation != self.generation {
            return;
        }
        self.kill_mcu_session().await;
    }

    /// Feed one hardware event word into the state machine.
    pub async fn handle_event(&mut self, word: u32) {
        let event = FpEvent(word);
        let Some(action) = self.pending.take() else {
            warn!(%event, "event with no pending session action");
            return;
        };
        match action {
            PendingAction::EnrollImage { record } => self.do_enroll_image(record, event).await,
            PendingAction::EnrollFingerUp { record } => {
                self.do_enroll_finger_up(record, event).await
            }
            PendingAction::Match { attempt } => self.do_match(attempt, event).await,
            PendingAction::MatchFingerUp => self.do_match_finger_up(event).await,
        }
    }

    async fn kill_mcu_session(&mut self) {
        // Force the sensor idle before invalidating the pending action,
        // so a stray late event cannot be taken for a fresh session's.
        if let Err(err) = self.driver.set_mode(SensorMode::None).await {
            warn!(%err, "failed to idle the sensor while ending session");
        }
        self.pending = None;
        self.session_live = false;
    }

    async fn fail_session(&mut self) {
        self.kill_mcu_session().await;
        if let Some(cb) = self.on_session_failed.as_mut() {
            cb();
        }
    }

    fn notify_enroll(&mut self, result: ScanResult, progress: EnrollProgress) {
        if let Some(cb) = self.on_enroll_scan_done.as_mut() {
            cb(result, progress);
        }
    }

    fn notify_auth(&mut self, result: ScanResult, matches: AttemptMatches) {
        if let Some(cb) = self.on_auth_scan_done.as_mut() {
            cb(result, matches);
        }
    }

    async fn request_enroll_image(&mut self, record: InternalRecord) -> Result<()> {
        self.pending = Some(PendingAction::EnrollImage { record });
        if let Err(err) = self.driver.set_mode(SensorMode::EnrollSessionEnrollImage).await {
            self.pending = None;
            error!(%err, "failed to start enrolling mode");
            return Err(err);
        }
        Ok(())
    }

    async fn request_enroll_finger_up(&mut self, record: InternalRecord) -> Result<()> {
        self.pending = Some(PendingAction::EnrollFingerUp { record });
        if let Err(err) = self.driver.set_mode(SensorMode::EnrollSessionFingerUp).await {
            self.pending = None;
            error!(%err, "failed to wait for finger up");
            return Err(err);
        }
        Ok(())
    }

    async fn request_match(&mut self, attempt: u32) -> Result<()> {
        self.pending = Some(PendingAction::Match { attempt });
        if let Err(err) = self.driver.set_mode(SensorMode::Match).await {
            self.pending = None;
            error!(%err, "failed to start matching mode");
            return Err(err);
        }
        Ok(())
    }

    async fn request_match_finger_up(&mut self) -> Result<()> {
        self.pending = Some(PendingAction::MatchFingerUp);
        if let Err(err) = self.driver.set_mode(SensorMode::FingerUp).await {
            self.pending = None;
            error!(%err, "failed to request finger up event");
            return Err(err);
        }
        Ok(())
    }

    async fn do_enroll_image(&mut self, record: InternalRecord, event: FpEvent) {
        if !event.is_enroll() {
            // Keep waiting for the proper event, do not abort the session.
            warn!(%event, "unexpected event while waiting for enroll image");
            self.pending = Some(PendingAction::EnrollImage { record });
            return;
        }

        let scan_result = match event.enroll_result() {
            EnrollEvent::Ok => ScanResult::Success,
            EnrollEvent::Immobile => ScanResult::Immobile,
            EnrollEvent::LowCoverage => ScanResult::Partial,
            EnrollEvent::LowQuality => ScanResult::Insufficient,
            EnrollEvent::Internal | EnrollEvent::Unknown(_) => {
                error!(%event, "unexpected result from capture");
                self.fail_session().await;
                return;
            }
        };

        let percent = event.enroll_progress();
        if percent < 100 {
            self.notify_enroll(scan_result, EnrollProgress {
                done: false,
                percent,
            });

            // The finger must lift before the next capture, otherwise
            // the same contact is captured again.
            if self.request_enroll_finger_up(record).await.is_err() {
                self.fail_session().await;
            }
            return;
        }

        // Captures are done; retrieve the new template and persist it.
        let template = match self.driver.get_last_template().await {
            Ok(template) => template,
            Err(err) => {
                error!(%err, "failed to retrieve enrolled finger");
                self.fail_session().await;
                return;
            }
        };

        let mut record = record;
        if self.driver.supports_positive_match_secret() {
            let slot = self.records.len();
            match self.read_validation_value(slot, &record.user_id).await {
                Ok(value) => record.validation_value = Some(value),
                Err(err) => {
                    error!(%err, "failed to derive validation value for new record");
                    self.fail_session().await;
                    return;
                }
            }
        }

        self.records.push(record);
        let idx = self.records.len() - 1;
        if let Err(err) = self.persist_record(idx, &template).await {
            error!(%err, "failed to persist enrolled record");
            self.records.pop();
            self.fail_session().await;
            return;
        }

        self.notify_enroll(ScanResult::Success, EnrollProgress {
            done: true,
            percent: 100,
        });
    }

    async fn do_enroll_finger_up(&mut self, record: InternalRecord, event: FpEvent) {
        if !event.is_finger_up() {
            warn!(%event, "unexpected event while waiting for finger up");
            self.pending = Some(PendingAction::EnrollFingerUp { record });
            return;
        }
        if self.request_enroll_image(record).await.is_err() {
            self.fail_session().await;
        }
    }

    async fn do_match(&mut self, attempt: u32, event: FpEvent) {
        if !event.is_match() {
            warn!(%event, "unexpected event while waiting for match");
            self.pending = Some(PendingAction::Match { attempt });
            return;
        }

        let outcome = event.match_result();

        // A finger settling onto the sensor reads as low coverage; retry
        // silently instead of surfacing an error the user cannot act on.
        if outcome == MatchEvent::NoLowCoverage && attempt < MAX_PARTIAL_ATTEMPTS {
            if self.request_match(attempt + 1).await.is_err() {
                self.fail_session().await;
            }
            return;
        }

        // Ask for finger-up right away so the hardware cannot begin a
        // second match while this result is still being processed.
        if self.request_match_finger_up().await.is_err() {
            self.fail_session().await;
            return;
        }

        let mut dirty = Vec::new();
        if outcome == MatchEvent::YesUpdated {
            match self.driver.get_dirty_map().await {
                Ok(list) => dirty = list,
                Err(err) => error!(%err, "failed to get updated templates map"),
            }
        }

        let match_idx = event.match_idx();
        info!(?outcome, match_idx, "match event");

        let mut matches = AttemptMatches::new();
        let mut confirmed = false;
        let result = match outcome {
            MatchEvent::NoInternal => {
                error!(%event, "internal error when matching templates");
                // Reported as a completed scan with no matches; that is
                // the API the control plane expects.
                ScanResult::Success
            }
            MatchEvent::No | MatchEvent::NoTemplates => ScanResult::Success,
            MatchEvent::Yes | MatchEvent::YesUpdated | MatchEvent::YesUpdateFailed => {
                if match_idx < self.records.len() {
                    match self.confirm_match(match_idx).await {
                        Ok(true) => {
                            confirmed = true;
                            let record = &self.records[match_idx];
                            matches.insert(
                                record.user_id.clone(),
                                vec![record.record_id.clone()],
                            );
                        }
                        Ok(false) => {
                            error!(
                                record_id = %self.records[match_idx].record_id,
                                "validation value mismatch, match suppressed"
                            );
                        }
                        Err(err) => {
                            error!(%err, "failed to verify match secret, match suppressed");
                        }
                    }
                } else {
                    error!(match_idx, "invalid finger index");
                }
                ScanResult::Success
            }
            MatchEvent::NoLowQuality => ScanResult::Insufficient,
            // The retry ceiling was hit; degraded but terminal.
            MatchEvent::NoLowCoverage => ScanResult::Partial,
            MatchEvent::Unknown(_) => {
                error!(%event, "unexpected result from matching templates");
                self.fail_session().await;
                return;
            }
        };

        // The caller hears the outcome before any housekeeping below.
        self.notify_auth(result, matches);

        match self.driver.get_stats().await {
            Ok(Some(stats)) => self.telemetry.match_latency(confirmed, stats),
            Ok(None) => {}
            Err(err) => warn!(%err, "failed to read match stats"),
        }

        // Re-persist templates the on-device matcher updated. The auth
        // result is already delivered; failures here are logged only.
        for idx in dirty {
            if idx >= self.records.len() {
                warn!(idx, "dirty slot with no record");
                continue;
            }
            let template = match self.driver.get_template(idx).await {
                Ok(template) => template,
                Err(err) => {
                    error!(idx, %err, "failed to retrieve updated template");
                    continue;
                }
            };
            if let Err(err) = self.persist_record(idx, &template).await {
                error!(
                    record_id = %self.records[idx].record_id,
                    %err,
                    "cannot update record in storage after match"
                );
            }
        }
    }

    async fn do_match_finger_up(&mut self, event: FpEvent) {
        if !event.is_finger_up() {
            warn!(%event, "unexpected event while waiting for finger up");
            self.pending = Some(PendingAction::MatchFingerUp);
            return;
        }
        // Finger lifted; match the next touch.
        if self.request_match(0).await.is_err() {
            self.fail_session().await;
        }
    }

    /// Re-derive the validation value for a matched slot and compare it
    /// with the one stored at enrollment. Records without a stored value
    /// predate validation support and are trusted as matched.
    async fn confirm_match(&mut self, idx: usize) -> Result<bool> {
        if !self.driver.supports_positive_match_secret() {
            return Ok(true);
        }
        let Some(stored) = self.records[idx].validation_value else {
            return Ok(true);
        };
        let user_id = self.records[idx].user_id.clone();
        let secret = self.driver.positive_match_secret(idx).await?;
        let derived = compute_validation_value(&secret, &user_id)?;
        Ok(derived == stored)
    }

    async fn read_validation_value(
        &mut self,
        slot: usize,
        user_id: &str,
    ) -> Result<fpmcu_types::ValidationValue> {
        let secret = self.driver.positive_match_secret(slot).await?;
        compute_validation_value(&secret, user_id)
    }

    async fn persist_record(&mut self, idx: usize, template: &VendorTemplate) -> Result<()> {
        let record = &self.records[idx];
        let stored = StoredRecord {
            format_version: RECORD_FORMAT_VERSION,
            user_id: record.user_id.clone(),
            label: record.label.clone(),
            record_id: record.record_id.clone(),
            validation_value: record.validation_value,
            template_base64: BASE64_STANDARD.encode(template.as_bytes()),
        };
        self.storage.write_record(&stored).await
    }

    fn find_record(&self, record_id: &str) -> Result<usize> {
        self.records
            .iter()
            .position(|r| r.record_id == record_id)
            .ok_or_else(|| Error::RecordNotFound(record_id.to_string()))
    }

    /// Update a record's label, rolling back on persistence failure.
    pub async fn set_label(&mut self, record_id: &str, label: &str) -> Result<()> {
        let idx = self.find_record(record_id)?;
        // TODO: read the template back from storage instead of the device.
        let template = self.driver.get_template(idx).await?;

        let old_label = std::mem::replace(&mut self.records[idx].label, label.to_string());
        if let Err(err) = self.persist_record(idx, &template).await {
            self.records[idx].label = old_label;
            return Err(err);
        }
        Ok(())
    }

    /// Remove one record.
    ///
    /// Slot index is positional, so removal cannot shift entries: the
    /// persisted file is deleted, the whole in-memory table is cleared,
    /// and the user's remaining records are reloaded, which rebinds
    /// slots 0..N-1 in storage order.
    pub async fn remove_record(&mut self, record_id: &str) -> Result<()> {
        let idx = self.find_record(record_id)?;
        let user_id = self.records[idx].user_id.clone();

        self.storage.delete_record(&user_id, record_id).await?;

        self.records.clear();
        self.load_user(&user_id).await
    }

    /// Delete every record from storage and memory.
    pub async fn destroy_all_records(&mut self) -> Result<()> {
        let mut all_deleted = true;
        for record in &self.records {
            if self
                .storage
                .delete_record(&record.user_id, &record.record_id)
                .await
                .is_err()
            {
                all_deleted = false;
            }
        }
        self.forget_records().await;
        if all_deleted {
            Ok(())
        } else {
            Err(Error::Storage("failed to delete one or more records".into()))
        }
    }

    /// Drop the in-memory table and clear the device context.
    pub async fn forget_records(&mut self) {
        self.records.clear();
        if let Err(err) = self.driver.reset_context().await {
            error!(%err, "failed to reset context");
        }
    }

    /// Select `user_id`'s context and upload their stored records.
    /// Records that can no longer be used are dropped, the rest load in
    /// storage order, re-establishing slot indices.
    pub async fn load_user(&mut self, user_id: &str) -> Result<()> {
        self.driver.set_context(user_id).await?;
        let stored = self.storage.read_records_for_user(user_id).await?;
        for record in stored {
            let record_id = record.record_id.clone();
            if let Err(err) = self.load_record(record).await {
                error!(%record_id, %err, "dropping record that failed to load");
            }
        }
        Ok(())
    }

    async fn load_record(&mut self, stored: StoredRecord) -> Result<()> {
        if self.records.len() >= self.driver.max_template_count() {
            error!(record_id = %stored.record_id, "no space to upload template");
            return Err(Error::NoSpace);
        }

        let data = BASE64_STANDARD.decode(&stored.template_base64).map_err(|_| {
            Error::Storage(format!(
                "record {} template is not valid base64",
                stored.record_id
            ))
        })?;
        let template = VendorTemplate::new(data);

        let version = template.format_version()?;
        if version as u32 != self.driver.template_version() {
            error!(
                record_id = %stored.record_id,
                template = version,
                device = self.driver.template_version(),
                "template format version mismatch"
            );
            // This firmware can never use the record; delete it rather
            // than failing every future load.
            let _ = self
                .storage
                .delete_record(&stored.user_id, &stored.record_id)
                .await;
            return Err(Error::TemplateVersionMismatch {
                template: version,
                device: self.driver.template_version(),
            });
        }

        info!(record_id = %stored.record_id, "uploading record");
        self.driver.upload_template(&template).await?;

        self.records.push(InternalRecord {
            record_id: stored.record_id,
            user_id: stored.user_id,
            label: stored.label,
            validation_value: stored.validation_value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoTelemetry;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const TEMPLATE_VERSION: u32 = 4;

    fn template(bytes: &[u8]) -> VendorTemplate {
        // Valid blobs start with the little-endian format version.
        let mut data = vec![TEMPLATE_VERSION as u8, 0];
        data.extend_from_slice(bytes);
        VendorTemplate::new(data)
    }

    fn enroll_event(code: u32, percent: u32) -> u32 {
        (1 << 27) | (percent << 4) | code
    }

    fn match_event(code: u32, idx: u32) -> u32 {
        (1 << 28) | (idx << 12) | code
    }

    fn finger_up_event() -> u32 {
        1 << 30
    }

    #[derive(Default)]
    struct FakeDriver {
        mode_log: Vec<SensorMode>,
        fail_set_mode: bool,
        max_templates: usize,
        template_version: u32,
        last_template: Option<VendorTemplate>,
        templates: HashMap<usize, VendorTemplate>,
        uploaded: Vec<VendorTemplate>,
        context_log: Vec<String>,
        dirty: Vec<usize>,
        supports_secret: bool,
        secrets: HashMap<usize, Vec<u8>>,
        stats: Option<fpmcu_types::FpStats>,
    }

    #[async_trait]
    impl SensorDriver for FakeDriver {
        async fn set_mode(&mut self, mode: SensorMode) -> Result<()> {
            if self.fail_set_mode {
                return Err(Error::Core(fpmcu_core::Error::Timeout));
            }
            self.mode_log.push(mode);
            Ok(())
        }

        async fn get_mode(&mut self) -> Result<SensorMode> {
            Ok(self.mode_log.last().copied().unwrap_or(SensorMode::None))
        }

        async fn get_template(&mut self, slot: usize) -> Result<VendorTemplate> {
            self.templates.get(&slot).cloned().ok_or(Error::InvalidSlot {
                slot,
                valid: self.templates.len(),
            })
        }

        async fn get_last_template(&mut self) -> Result<VendorTemplate> {
            self.last_template.clone().ok_or(Error::NoNewTemplate)
        }

        async fn upload_template(&mut self, template: &VendorTemplate) -> Result<()> {
            self.uploaded.push(template.clone());
            Ok(())
        }

        async fn set_context(&mut self, user_id_hex: &str) -> Result<()> {
            self.context_log.push(user_id_hex.to_string());
            Ok(())
        }

        async fn reset_context(&mut self) -> Result<()> {
            self.context_log.push(String::new());
            Ok(())
        }

        async fn get_dirty_map(&mut self) -> Result<Vec<usize>> {
            Ok(self.dirty.clone())
        }

        async fn get_stats(&mut self) -> Result<Option<fpmcu_types::FpStats>> {
            Ok(self.stats)
        }

        async fn positive_match_secret(&mut self, slot: usize) -> Result<Vec<u8>> {
            self.secrets
                .get(&slot)
                .cloned()
                .ok_or(Error::SecretUnsupported)
        }

        fn max_template_count(&self) -> usize {
            self.max_templates
        }

        fn template_version(&self) -> u32 {
            self.template_version
        }

        fn supports_positive_match_secret(&self) -> bool {
            self.supports_secret
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        records: Vec<StoredRecord>,
        writes: usize,
        fail_next_write: bool,
        fail_delete: bool,
        next_id: u32,
    }

    #[async_trait]
    impl RecordStorage for FakeStorage {
        async fn write_record(&mut self, record: &StoredRecord) -> Result<()> {
            self.writes += 1;
            if self.fail_next_write {
                self.fail_next_write = false;
                return Err(Error::Storage("disk full".into()));
            }
            if let Some(existing) = self
                .records
                .iter_mut()
                .find(|r| r.record_id == record.record_id)
            {
                *existing = record.clone();
            } else {
                self.records.push(record.clone());
            }
            Ok(())
        }

        async fn delete_record(&mut self, user_id: &str, record_id: &str) -> Result<()> {
            if self.fail_delete {
                return Err(Error::Storage("delete failed".into()));
            }
            self.records
                .retain(|r| !(r.user_id == user_id && r.record_id == record_id));
            Ok(())
        }

        async fn read_records_for_user(&mut self, user_id: &str) -> Result<Vec<StoredRecord>> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect())
        }

        fn generate_new_record_id(&mut self) -> String {
            self.next_id += 1;
            format!("rec{}", self.next_id)
        }
    }

    fn basic_driver() -> FakeDriver {
        FakeDriver {
            max_templates: 5,
            template_version: TEMPLATE_VERSION,
            ..Default::default()
        }
    }

    fn manager(
        driver: FakeDriver,
        storage: FakeStorage,
    ) -> SessionManager<FakeDriver, FakeStorage> {
        SessionManager::new(driver, storage, Arc::new(NoTelemetry))
    }

    fn stored(user_id: &str, record_id: &str, tmpl: &VendorTemplate) -> StoredRecord {
        StoredRecord {
            format_version: RECORD_FORMAT_VERSION,
            user_id: user_id.into(),
            label: format!("label-{record_id}"),
            record_id: record_id.into(),
            validation_value: None,
            template_base64: BASE64_STANDARD.encode(tmpl.as_bytes()),
        }
    }

    fn in_memory(user_id: &str, record_id: &str) -> InternalRecord {
        InternalRecord {
            record_id: record_id.into(),
            user_id: user_id.into(),
            label: format!("label-{record_id}"),
            validation_value: None,
        }
    }

    type EnrollLog = Arc<Mutex<Vec<(ScanResult, EnrollProgress)>>>;
    type AuthLog = Arc<Mutex<Vec<(ScanResult, AttemptMatches)>>>;

    fn capture_enroll(m: &mut SessionManager<FakeDriver, FakeStorage>) -> EnrollLog {
        let log: EnrollLog = Arc::default();
        let sink = log.clone();
        m.on_enroll_scan_done(move |r, p| sink.lock().unwrap().push((r, p)));
        log
    }

    fn capture_auth(m: &mut SessionManager<FakeDriver, FakeStorage>) -> AuthLog {
        let log: AuthLog = Arc::default();
        let sink = log.clone();
        m.on_auth_scan_done(move |r, matches| sink.lock().unwrap().push((r, matches)));
        log
    }

    fn capture_failures(m: &mut SessionManager<FakeDriver, FakeStorage>) -> Arc<Mutex<u32>> {
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        m.on_session_failed(move || *sink.lock().unwrap() += 1);
        count
    }

    #[tokio::test]
    async fn test_enroll_happy_path() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[9, 9, 9]));
        let mut m = manager(driver, FakeStorage::default());
        let enroll_log = capture_enroll(&mut m);

        let handle = m.start_enroll("aabb", "right-index").await.unwrap();
        m.handle_event(enroll_event(0, 25)).await;
        m.handle_event(finger_up_event()).await;
        m.handle_event(enroll_event(0, 100)).await;

        assert_eq!(m.records.len(), 1);
        assert_eq!(m.records[0].record_id, "rec1");
        assert_eq!(m.storage.records.len(), 1);
        assert_eq!(
            m.storage.records[0].template_base64,
            BASE64_STANDARD.encode(template(&[9, 9, 9]).as_bytes())
        );
        assert_eq!(
            *enroll_log.lock().unwrap(),
            vec![
                (ScanResult::Success, EnrollProgress { done: false, percent: 25 }),
                (ScanResult::Success, EnrollProgress { done: true, percent: 100 }),
            ]
        );
        // Capture, then wait for finger lift, then capture again.
        assert_eq!(
            m.driver.mode_log,
            vec![
                SensorMode::EnrollSessionEnrollImage,
                SensorMode::EnrollSessionFingerUp,
                SensorMode::EnrollSessionEnrollImage,
            ]
        );

        m.end_session(handle).await;
        assert_eq!(m.driver.mode_log.last(), Some(&SensorMode::None));

        // Ending again is a no-op: no second idle command.
        let idles = m
            .driver
            .mode_log
            .iter()
            .filter(|&&mode| mode == SensorMode::None)
            .count();
        m.end_session(handle).await;
        let idles_after = m
            .driver
            .mode_log
            .iter()
            .filter(|&&mode| mode == SensorMode::None)
            .count();
        assert_eq!(idles, idles_after);
    }

    #[tokio::test]
    async fn test_second_session_rejected_without_side_effects() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[1]));
        let mut m = manager(driver, FakeStorage::default());

        let _handle = m.start_enroll("aabb", "l").await.unwrap();
        let modes_before = m.driver.mode_log.len();
        let writes_before = m.storage.writes;

        assert!(matches!(m.start_auth().await, Err(Error::SessionActive)));
        assert!(matches!(
            m.start_enroll("ccdd", "l2").await,
            Err(Error::SessionActive)
        ));
        assert_eq!(m.driver.mode_log.len(), modes_before);
        assert_eq!(m.storage.writes, writes_before);
    }

    #[tokio::test]
    async fn test_enroll_fails_before_capture_when_table_full() {
        let mut driver = basic_driver();
        driver.max_templates = 2;
        let mut m = manager(driver, FakeStorage::default());
        m.records.push(in_memory("u", "a"));
        m.records.push(in_memory("u", "b"));

        assert!(matches!(
            m.start_enroll("u", "l").await,
            Err(Error::NoSpace)
        ));
        // No capture request reached the device.
        assert!(m.driver.mode_log.is_empty());
    }

    #[tokio::test]
    async fn test_enroll_with_one_free_slot_succeeds() {
        let mut driver = basic_driver();
        driver.max_templates = 2;
        driver.last_template = Some(template(&[7]));
        let mut m = manager(driver, FakeStorage::default());
        m.records.push(in_memory("u", "a"));

        m.start_enroll("u", "l").await.unwrap();
        m.handle_event(enroll_event(0, 100)).await;
        assert_eq!(m.records.len(), 2);
    }

    #[tokio::test]
    async fn test_enroll_persist_failure_rolls_back() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[1]));
        let mut m = manager(driver, FakeStorage { fail_next_write: true, ..Default::default() });
        let failures = capture_failures(&mut m);
        let enroll_log = capture_enroll(&mut m);

        m.start_enroll("aabb", "l").await.unwrap();
        m.handle_event(enroll_event(0, 100)).await;

        assert!(m.records.is_empty());
        assert_eq!(*failures.lock().unwrap(), 1);
        assert!(enroll_log.lock().unwrap().is_empty());
        // Failure forced the sensor idle.
        assert_eq!(m.driver.mode_log.last(), Some(&SensorMode::None));
    }

    #[tokio::test]
    async fn test_enroll_internal_error_fails_session() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        let failures = capture_failures(&mut m);

        m.start_enroll("aabb", "l").await.unwrap();
        m.handle_event(enroll_event(5, 0)).await; // internal error code

        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(m.driver.mode_log.last(), Some(&SensorMode::None));
        assert!(m.records.is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_event_keeps_session_waiting() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[1]));
        let mut m = manager(driver, FakeStorage::default());
        let enroll_log = capture_enroll(&mut m);

        m.start_enroll("aabb", "l").await.unwrap();
        // A finger-up event arrives while an enroll image is pending.
        m.handle_event(finger_up_event()).await;
        assert!(enroll_log.lock().unwrap().is_empty());

        // The proper event still lands.
        m.handle_event(enroll_event(0, 100)).await;
        assert_eq!(m.records.len(), 1);
    }

    #[tokio::test]
    async fn test_stray_event_without_session_ignored() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        let enroll_log = capture_enroll(&mut m);
        let failures = capture_failures(&mut m);

        m.handle_event(enroll_event(0, 50)).await;

        assert!(enroll_log.lock().unwrap().is_empty());
        assert_eq!(*failures.lock().unwrap(), 0);
        assert!(m.driver.mode_log.is_empty());
    }

    #[tokio::test]
    async fn test_auth_match_resolves_record() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        m.records.push(in_memory("user1", "r1"));
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(1, 0)).await; // yes, slot 0

        let log = auth_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        let (result, matches) = &log[0];
        assert_eq!(*result, ScanResult::Success);
        assert_eq!(matches.get("user1"), Some(&vec!["r1".to_string()]));
        // Finger-up was requested before the result went out.
        assert_eq!(m.driver.mode_log, vec![SensorMode::Match, SensorMode::FingerUp]);
    }

    #[tokio::test]
    async fn test_auth_continues_after_finger_up() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        m.records.push(in_memory("user1", "r1"));
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(0, 0)).await; // no match
        m.handle_event(finger_up_event()).await; // lift, re-arm matching

        assert_eq!(auth_log.lock().unwrap().len(), 1);
        assert_eq!(
            m.driver.mode_log,
            vec![SensorMode::Match, SensorMode::FingerUp, SensorMode::Match]
        );
    }

    #[tokio::test]
    async fn test_low_coverage_retries_silently_then_terminates() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        // 20 low-coverage results: silently re-requested each time.
        for _ in 0..MAX_PARTIAL_ATTEMPTS {
            m.handle_event(match_event(4, 0)).await;
        }
        assert!(auth_log.lock().unwrap().is_empty());
        assert_eq!(m.driver.mode_log.len() as u32, 1 + MAX_PARTIAL_ATTEMPTS);

        // The 21st is terminal: degraded result, finger-up requested.
        m.handle_event(match_event(4, 0)).await;
        let log = auth_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, ScanResult::Partial);
        assert!(log[0].1.is_empty());
        assert_eq!(m.driver.mode_log.last(), Some(&SensorMode::FingerUp));
    }

    #[tokio::test]
    async fn test_validation_value_confirms_match() {
        let mut driver = basic_driver();
        driver.supports_secret = true;
        driver.secrets.insert(0, vec![1u8; 32]);
        let mut m = manager(driver, FakeStorage::default());

        let value = compute_validation_value(&[1u8; 32], "user1hex").unwrap();
        m.records.push(InternalRecord {
            record_id: "r1".into(),
            user_id: "user1hex".into(),
            label: "l".into(),
            validation_value: Some(value),
        });
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(1, 0)).await;

        let log = auth_log.lock().unwrap();
        assert_eq!(log[0].1.get("user1hex"), Some(&vec!["r1".to_string()]));
    }

    #[tokio::test]
    async fn test_validation_value_mismatch_suppresses_match() {
        let mut driver = basic_driver();
        driver.supports_secret = true;
        // The device now derives from a different secret than the one
        // captured at enrollment.
        driver.secrets.insert(0, vec![2u8; 32]);
        let mut m = manager(driver, FakeStorage::default());

        let enrolled = compute_validation_value(&[1u8; 32], "user1hex").unwrap();
        m.records.push(InternalRecord {
            record_id: "r1".into(),
            user_id: "user1hex".into(),
            label: "l".into(),
            validation_value: Some(enrolled),
        });
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(1, 0)).await;

        let log = auth_log.lock().unwrap();
        assert_eq!(log.len(), 1);
        // Scan completed, but the claimed match was not surfaced.
        assert_eq!(log[0].0, ScanResult::Success);
        assert!(log[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_match_update_repersists_template() {
        let mut driver = basic_driver();
        driver.dirty = vec![0];
        driver.templates.insert(0, template(&[0xEE]));
        let mut m = manager(driver, FakeStorage::default());
        m.records.push(in_memory("user1", "r1"));
        let auth_log = capture_auth(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(3, 0)).await; // yes-updated

        assert_eq!(auth_log.lock().unwrap().len(), 1);
        assert_eq!(m.storage.records.len(), 1);
        assert_eq!(
            m.storage.records[0].template_base64,
            BASE64_STANDARD.encode(template(&[0xEE]).as_bytes())
        );
    }

    #[tokio::test]
    async fn test_match_update_persist_failure_keeps_result() {
        let mut driver = basic_driver();
        driver.dirty = vec![0];
        driver.templates.insert(0, template(&[0xEE]));
        let mut m = manager(
            driver,
            FakeStorage { fail_next_write: true, ..Default::default() },
        );
        m.records.push(in_memory("user1", "r1"));
        let auth_log = capture_auth(&mut m);
        let failures = capture_failures(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(3, 0)).await;

        // The auth result was delivered; the failed re-persist is only
        // logged and the record stays in memory.
        let log = auth_log.lock().unwrap();
        assert_eq!(log[0].1.get("user1"), Some(&vec!["r1".to_string()]));
        assert_eq!(*failures.lock().unwrap(), 0);
        assert_eq!(m.records.len(), 1);
    }

    #[tokio::test]
    async fn test_match_unknown_code_fails_session() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        let failures = capture_failures(&mut m);

        m.start_auth().await.unwrap();
        m.handle_event(match_event(9, 0)).await;

        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(m.driver.mode_log.last(), Some(&SensorMode::None));
    }

    #[tokio::test]
    async fn test_remove_record_reloads_remaining_in_order() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[0]));
        let mut m = manager(driver, FakeStorage::default());

        for id in ["a", "b", "c"] {
            let tmpl = template(id.as_bytes());
            m.storage.records.push(stored("u1", id, &tmpl));
            m.records.push(in_memory("u1", id));
        }

        m.remove_record("b").await.unwrap();

        let remaining: Vec<_> = m
            .storage
            .records
            .iter()
            .map(|r| r.record_id.clone())
            .collect();
        assert_eq!(remaining, vec!["a", "c"]);
        // In-memory slot order matches the reload order from storage.
        let slots: Vec<_> = m.records.iter().map(|r| r.record_id.clone()).collect();
        assert_eq!(slots, vec!["a", "c"]);
        // Context was re-selected and both templates re-uploaded.
        assert_eq!(m.driver.context_log.last(), Some(&"u1".to_string()));
        assert_eq!(m.driver.uploaded.len(), 2);
    }

    #[tokio::test]
    async fn test_set_label_rolls_back_on_write_failure() {
        let mut driver = basic_driver();
        driver.templates.insert(0, template(&[5]));
        let mut m = manager(
            driver,
            FakeStorage { fail_next_write: true, ..Default::default() },
        );
        m.records.push(in_memory("u1", "r1"));

        assert!(m.set_label("r1", "new-label").await.is_err());
        assert_eq!(m.records[0].label, "label-r1");

        // And the success path sticks.
        m.storage.records.push(stored("u1", "r1", &template(&[5])));
        m.set_label("r1", "new-label").await.unwrap();
        assert_eq!(m.records[0].label, "new-label");
        assert_eq!(m.storage.records[0].label, "new-label");
    }

    #[tokio::test]
    async fn test_load_user_drops_version_mismatched_record() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());

        let stale = VendorTemplate::new(vec![3, 0, 1, 2]); // version 3, device wants 4
        let fresh = template(&[1, 2]);
        m.storage.records.push(stored("u1", "old", &stale));
        m.storage.records.push(stored("u1", "new", &fresh));

        m.load_user("u1").await.unwrap();

        // The stale record was deleted from storage and skipped; the
        // valid one loaded into slot 0.
        assert_eq!(m.records.len(), 1);
        assert_eq!(m.records[0].record_id, "new");
        assert_eq!(m.storage.records.len(), 1);
        assert_eq!(m.storage.records[0].record_id, "new");
        assert_eq!(m.driver.uploaded.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_all_records() {
        let driver = basic_driver();
        let mut m = manager(driver, FakeStorage::default());
        for id in ["a", "b"] {
            m.storage.records.push(stored("u1", id, &template(&[1])));
            m.records.push(in_memory("u1", id));
        }

        m.destroy_all_records().await.unwrap();

        assert!(m.records.is_empty());
        assert!(m.storage.records.is_empty());
        // The device context was cleared.
        assert_eq!(m.driver.context_log.last(), Some(&String::new()));
    }

    #[tokio::test]
    async fn test_session_can_restart_after_end() {
        let mut driver = basic_driver();
        driver.last_template = Some(template(&[1]));
        let mut m = manager(driver, FakeStorage::default());

        let handle = m.start_auth().await.unwrap();
        m.end_session(handle).await;

        // A fresh session starts cleanly from idle.
        m.start_enroll("aabb", "l").await.unwrap();
        assert_eq!(
            m.driver.mode_log.last(),
            Some(&SensorMode::EnrollSessionEnrollImage)
        );
    }
}
