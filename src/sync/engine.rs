use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::diff::diff_grains;
use super::report::{SliceReport, SyncReport};
use crate::auth::{CurrentUser, enforce_role, enforce_server_role};
use crate::credentials::{Credentials, SyncKey};
use crate::error::{Error, Result};
use crate::remote::{Connector, Remote};
use crate::store::Store;
use crate::types::{Grain, Role, ServerRole, Slice, Subscription, SyncStatus};

fn millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Drives reconciliation sessions from this (secondary) server against its
/// primaries.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    key: Option<SyncKey>,
    role: ServerRole,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn Connector>,
        key: Option<SyncKey>,
        role: ServerRole,
    ) -> Self {
        Self {
            store,
            connector,
            key,
            role,
        }
    }

    /// Runs one session against the primary company `primary_id`.
    ///
    /// Per-slice failures are logged and reported; the session carries on.
    /// Anything that stops the session is returned as the error. Either way a
    /// session row lands in the activity log once the gates have passed.
    pub fn start(&self, user: &CurrentUser, primary_id: Uuid) -> Result<SyncReport> {
        enforce_server_role(self.role, ServerRole::Secondary)?;
        enforce_role(user, Role::Admin)?;

        let started = Instant::now();
        let mut report = SyncReport {
            primary_id,
            ..SyncReport::default()
        };
        let mut label = format!("Syncing \"{primary_id}\"");

        let result = self.session(primary_id, &mut label, &mut report);

        let elapsed = started.elapsed();
        report.duration_ms = millis(elapsed);
        let err = result.as_ref().err().map(ToString::to_string);
        if let Err(e) = self
            .store
            .log_activity(None, &label, elapsed, err.as_deref())
        {
            warn!(error = %e, "failed to record sync session");
        }

        match result {
            Ok(()) => {
                info!(
                    primary = %report.primary_name,
                    slices = report.slices.len(),
                    errors = report.errors(),
                    duration_ms = report.duration_ms,
                    "sync session finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(%primary_id, error = %e, "sync session failed");
                Err(e)
            }
        }
    }

    fn session(&self, primary_id: Uuid, label: &mut String, report: &mut SyncReport) -> Result<()> {
        let primary = self.store.company(primary_id)?;
        *label = format!("Syncing \"{}\" ({})", primary.name, primary.sync_addr);
        report.primary_name = primary.name.clone();

        if !primary.active {
            return Err(Error::forbidden(format!(
                "company \"{}\" is inactive",
                primary.name
            )));
        }
        if primary.sync_addr.is_empty() {
            return Err(Error::Config(format!(
                "company \"{}\" has no sync address",
                primary.name
            )));
        }
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| Error::Config("no sync key configured".to_string()))?;
        let credentials = Credentials::decrypt(&primary.sync_api_key, key)?;

        info!(primary = %primary.name, addr = %primary.sync_addr, "starting sync session");
        let remote = self.connector.connect(&primary.sync_addr, &credentials)?;

        let remote_subs = remote.all_subs()?;
        let local: HashMap<Uuid, Subscription> = self
            .store
            .subscriptions(primary_id)?
            .into_iter()
            .map(|sub| (sub.sub_id, sub))
            .collect();

        for remote_sub in &remote_subs {
            let started = Instant::now();
            match self.reconcile(remote.as_ref(), primary_id, remote_sub, &local, report) {
                Ok(Some(slice_report)) => report.slices.push(slice_report),
                Ok(None) => {}
                Err(e) => {
                    let name = remote_sub
                        .slice
                        .as_ref()
                        .map_or(remote_sub.name.as_str(), |s| s.name.as_str());
                    warn!(slice = name, sub_id = %remote_sub.sub_id, error = %e, "slice sync failed");

                    let detail = e.to_string();
                    if let Err(log_err) = self.store.log_activity(
                        Some(remote_sub.sub_id),
                        &format!("Syncing slice \"{name}\""),
                        started.elapsed(),
                        Some(&detail),
                    ) {
                        warn!(error = %log_err, "failed to record slice error");
                    }
                    report.slices.push(SliceReport {
                        sub_id: remote_sub.sub_id,
                        slice_id: remote_sub.slice_id,
                        slice_name: name.to_string(),
                        error: Some(detail),
                        ..SliceReport::default()
                    });
                }
            }
        }
        Ok(())
    }

    /// Mirrors one remote subscription and, when it is active on both sides,
    /// syncs its slice.
    fn reconcile(
        &self,
        remote: &dyn Remote,
        primary_id: Uuid,
        remote_sub: &Subscription,
        local: &HashMap<Uuid, Subscription>,
        report: &mut SyncReport,
    ) -> Result<Option<SliceReport>> {
        let remote_slice = remote_sub.slice.as_ref().ok_or_else(|| {
            Error::Remote(format!(
                "subscription \"{}\" arrived without its slice",
                remote_sub.name
            ))
        })?;

        let active = match local.get(&remote_sub.sub_id) {
            None => {
                let sub = Subscription {
                    company_id: primary_id,
                    slice: None,
                    ..remote_sub.clone()
                };
                self.store.add_subscription(&sub, remote_slice)?;
                info!(subscription = %sub.name, slice = %remote_slice.name, "new subscription");
                sub.active
            }
            Some(existing) if existing.active && !remote_sub.active => {
                self.store.deactivate_subscription(existing.sub_id)?;
                self.store.log_activity(
                    Some(existing.sub_id),
                    &format!("Subscription \"{}\" deactivated by primary", existing.name),
                    Duration::ZERO,
                    None,
                )?;
                report.deactivated.push(existing.sub_id);
                info!(subscription = %existing.name, "deactivated by primary");
                false
            }
            Some(existing) => existing.active && remote_sub.active,
        };

        if !active {
            debug!(subscription = %remote_sub.name, "subscription inactive, skipping");
            return Ok(None);
        }

        let local_slice = self.store.slice(remote_slice.id)?;
        self.sync_slice(remote, remote_sub.sub_id, &local_slice, remote_slice)
            .map(Some)
    }

    fn sync_slice(
        &self,
        remote: &dyn Remote,
        sub_id: Uuid,
        local: &Slice,
        remote_slice: &Slice,
    ) -> Result<SliceReport> {
        let mut slice_report = SliceReport {
            sub_id,
            slice_id: local.id,
            slice_name: remote_slice.name.clone(),
            ..SliceReport::default()
        };

        if !remote_slice.allow_sync {
            return Err(Error::SliceLocked(remote_slice.name.clone()));
        }
        // An unknown summary on either side never counts as a match.
        if remote_slice.content_hash.is_some() && remote_slice.content_hash == local.content_hash {
            debug!(slice = %remote_slice.name, "content hash unchanged");
            self.store
                .set_slice_sync_status(local.id, SyncStatus::Success)?;
            slice_report.unchanged = true;
            return Ok(slice_report);
        }
        if !self.store.begin_slice_sync(local.id)? {
            return Err(Error::SliceBusy(remote_slice.name.clone()));
        }

        let result = self.transfer(remote, local, remote_slice, &mut slice_report);
        let status = if result.is_ok() {
            SyncStatus::Success
        } else {
            SyncStatus::Error
        };
        if let Err(e) = self.store.set_slice_sync_status(local.id, status) {
            warn!(slice = %remote_slice.name, error = %e, "failed to record sync status");
        }
        result.map(|()| slice_report)
    }

    fn transfer(
        &self,
        remote: &dyn Remote,
        local: &Slice,
        remote_slice: &Slice,
        slice_report: &mut SliceReport,
    ) -> Result<()> {
        let remote_grains = remote.grain_list(remote_slice.id)?;
        let local_grains = self.store.grains(local.id, true)?;
        let diff = diff_grains(&remote_grains, &local_grains);
        let listed: HashMap<Uuid, &Grain> = remote_grains.iter().map(|g| (g.id, g)).collect();

        // Deletes go first: a replaced grain keeps its key under a new id.
        slice_report.deleted = self.store.delete_grains(&diff.deletes)?;
        for id in &diff.adds {
            let grain = listed
                .get(id)
                .copied()
                .filter(|g| g.slice_id == local.id)
                .ok_or_else(|| {
                    Error::Remote(format!("grain {id} is not listed under slice {}", local.id))
                })?;
            // Payloads go straight from the response into the store.
            let mut payload = remote.grain_payload(*id)?;
            self.store.add_grain_from(grain, payload.len, &mut payload.body)?;
            slice_report.added += 1;
        }

        slice_report.metadata_changed = self.store.update_slice_metadata(local.id, remote_slice)?;

        let refreshed = self.store.refresh_slice(local.id)?;
        if refreshed.content_hash != remote_slice.content_hash {
            let unknown = || "unknown".to_string();
            return Err(Error::HashMismatch {
                expected: remote_slice.content_hash.clone().unwrap_or_else(unknown),
                actual: refreshed.content_hash.unwrap_or_else(unknown),
            });
        }

        info!(
            slice = %remote_slice.name,
            added = slice_report.added,
            deleted = slice_report.deleted,
            metadata_changed = slice_report.metadata_changed,
            "slice synced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::codec::{self, Encoding};
    use crate::store::{Pagination, SqliteStore};
    use crate::types::{Company, Settings, SliceType};

    const PRIMARY_ADDR: &str = "http://primary.test";
    const SYNC_USER: &str = "partner-sync";
    const SYNC_PASSWORD: &str = "s3cret";

    #[derive(Default)]
    struct Calls {
        grain_list: AtomicUsize,
        grain: AtomicUsize,
    }

    impl Calls {
        fn reset(&self) {
            self.grain_list.store(0, Ordering::SeqCst);
            self.grain.store(0, Ordering::SeqCst);
        }

        fn transfers(&self) -> (usize, usize) {
            (
                self.grain_list.load(Ordering::SeqCst),
                self.grain.load(Ordering::SeqCst),
            )
        }
    }

    /// Content hashes a misbehaving primary advertises in place of the real
    /// ones, by slice.
    type Forged = Arc<Mutex<HashMap<Uuid, String>>>;

    /// A primary served straight from its own database.
    struct StoreRemote {
        store: Arc<SqliteStore>,
        company_id: Uuid,
        calls: Arc<Calls>,
        forged: Forged,
    }

    impl Remote for StoreRemote {
        fn all_subs(&self) -> Result<Vec<Subscription>> {
            let mut subs = self.store.subscriptions(self.company_id)?;
            let forged = self.forged.lock().unwrap();
            for slice in subs.iter_mut().filter_map(|sub| sub.slice.as_mut()) {
                if let Some(hash) = forged.get(&slice.id) {
                    slice.content_hash = Some(hash.clone());
                }
            }
            Ok(subs)
        }

        fn grain_list(&self, slice_id: Uuid) -> Result<Vec<Grain>> {
            self.calls.grain_list.fetch_add(1, Ordering::SeqCst);
            self.store.slice_access(self.company_id, slice_id)?;
            self.store.grains(slice_id, true)
        }

        fn grain(&self, id: Uuid) -> Result<Grain> {
            self.calls.grain.fetch_add(1, Ordering::SeqCst);
            self.store.grain(id, true)
        }

        fn slice_by_id(&self, id: Uuid) -> Result<Slice> {
            self.store.slice(id)
        }

        fn slice_by_name(&self, name: &str) -> Result<Slice> {
            self.store.slice_by_name(name)
        }

        fn list_slices(&self) -> Result<Vec<Slice>> {
            self.store.list_slices(None, Pagination::default(), None)
        }

        fn refresh_slice(&self, id: Uuid) -> Result<Slice> {
            self.store.refresh_slice(id)
        }

        fn lock_slice(&self, id: Uuid) -> Result<()> {
            self.store.lock_slice(id)
        }

        fn unlock_slice(&self, id: Uuid) -> Result<()> {
            self.store.unlock_slice(id)
        }

        fn server_role(&self) -> Result<Settings> {
            self.store.settings()?.ok_or(Error::NotFound)
        }
    }

    struct StoreConnector {
        store: Arc<SqliteStore>,
        company_id: Uuid,
        calls: Arc<Calls>,
        forged: Forged,
    }

    impl Connector for StoreConnector {
        fn connect(&self, addr: &str, credentials: &Credentials) -> Result<Box<dyn Remote>> {
            if addr != PRIMARY_ADDR {
                return Err(Error::Remote(format!("no route to {addr}")));
            }
            if credentials.username != SYNC_USER || credentials.password != SYNC_PASSWORD {
                return Err(Error::InvalidCredentials);
            }
            Ok(Box::new(StoreRemote {
                store: Arc::clone(&self.store),
                company_id: self.company_id,
                calls: Arc::clone(&self.calls),
                forged: Arc::clone(&self.forged),
            }))
        }
    }

    struct Harness {
        _temp: TempDir,
        primary: Arc<SqliteStore>,
        secondary: Arc<SqliteStore>,
        calls: Arc<Calls>,
        forged: Forged,
        engine: SyncEngine,
        /// The primary company as recorded on the secondary.
        primary_id: Uuid,
        /// Our company as recorded on the primary.
        partner_id: Uuid,
    }

    fn company(name: &str) -> Company {
        let now = Utc::now();
        Company {
            id: Uuid::new_v4(),
            name: name.to_string(),
            sync_addr: String::new(),
            sync_api_key: String::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn admin() -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            username: "admin".to_string(),
            email: String::new(),
            role: Role::Admin,
        }
    }

    impl Harness {
        fn new() -> Self {
            Self::with_role(ServerRole::Secondary)
        }

        fn with_role(role: ServerRole) -> Self {
            let temp = TempDir::new().unwrap();
            let primary = Arc::new(SqliteStore::new(temp.path().join("primary.db")).unwrap());
            let secondary = Arc::new(SqliteStore::new(temp.path().join("secondary.db")).unwrap());
            primary.initialize().unwrap();
            secondary.initialize().unwrap();

            let partner = company("partner");
            primary.create_company(&company("primary")).unwrap();
            primary.create_company(&partner).unwrap();

            let key = SyncKey::generate();
            let mut remote_company = company("primary");
            remote_company.sync_addr = PRIMARY_ADDR.to_string();
            remote_company.sync_api_key = Credentials::new(SYNC_USER, SYNC_PASSWORD)
                .encrypt(&key)
                .unwrap();
            secondary.create_company(&remote_company).unwrap();

            let calls = Arc::new(Calls::default());
            let forged = Forged::default();
            let connector = Arc::new(StoreConnector {
                store: Arc::clone(&primary),
                company_id: partner.id,
                calls: Arc::clone(&calls),
                forged: Arc::clone(&forged),
            });
            let engine = SyncEngine::new(
                Arc::clone(&secondary) as Arc<dyn Store>,
                connector,
                Some(key),
                role,
            );

            Self {
                _temp: temp,
                primary,
                secondary,
                calls,
                forged,
                engine,
                primary_id: remote_company.id,
                partner_id: partner.id,
            }
        }

        /// Creates a slice on the primary with raw grains and subscribes us.
        fn publish(&self, name: &str, grains: &[(&str, &str)]) -> (Slice, Subscription) {
            let mut slice = Slice::new(name, SliceType::AcesFile);
            slice.metadata.insert("source".to_string(), name.to_string());
            self.primary.create_slice(&slice).unwrap();
            for (key, payload) in grains {
                self.put(slice.id, key, payload);
            }
            let slice = self.primary.refresh_slice(slice.id).unwrap();
            let sub = Subscription::new(slice.id, self.partner_id, format!("{name}-sub"));
            self.primary.add_subscription(&sub, &slice).unwrap();
            (slice, sub)
        }

        fn put(&self, slice_id: Uuid, key: &str, payload: &str) -> Grain {
            let grain = Grain::new(slice_id, key, Encoding::Raw, payload);
            self.primary.create_grain(true, &grain).unwrap();
            grain
        }

        /// Makes the primary advertise `hash` for a slice from now on.
        fn forge(&self, slice_id: Uuid, hash: &str) {
            self.forged.lock().unwrap().insert(slice_id, hash.to_string());
        }

        fn remove(&self, slice_id: Uuid, key: &str) {
            let grain = self.primary.grain_by_key(slice_id, key, false).unwrap();
            self.primary.delete_grain(grain.id).unwrap();
        }

        fn sync(&self) -> SyncReport {
            self.engine.start(&admin(), self.primary_id).unwrap()
        }

        fn grains_on(store: &SqliteStore, slice_id: Uuid) -> BTreeMap<String, String> {
            store
                .grains(slice_id, false)
                .unwrap()
                .into_iter()
                .map(|g| (g.grain_key, g.payload.unwrap()))
                .collect()
        }

        fn activity(&self) -> Vec<crate::types::Activity> {
            self.secondary.list_activity(Pagination::default()).unwrap()
        }
    }

    fn assert_converged(h: &Harness, slice_id: Uuid) {
        let remote = h.primary.slice(slice_id).unwrap();
        let local = h.secondary.slice(slice_id).unwrap();
        assert_eq!(local.content_hash, remote.content_hash);
        assert_eq!(local.content_count, remote.content_count);
        assert_eq!(local.content_date, remote.content_date);
        assert_eq!(local.metadata, remote.metadata);
        assert_eq!(
            Harness::grains_on(&h.secondary, slice_id),
            Harness::grains_on(&h.primary, slice_id)
        );
    }

    #[test]
    fn test_cold_sync() {
        let h = Harness::new();
        let (slice, sub) = h.publish("S1", &[("g1", "aa"), ("g2", "bb")]);

        let report = h.sync();
        assert_eq!(report.errors(), 0);
        assert_eq!(report.slices[0].added, 2);

        let subs = h.secondary.subscriptions(h.primary_id).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].sub_id, sub.sub_id);
        assert_eq!(subs[0].company_id, h.primary_id);
        assert!(subs[0].active);
        assert_converged(&h, slice.id);

        let local = h.secondary.slice(slice.id).unwrap();
        assert_eq!(local.sync_status, SyncStatus::Success);
        assert!(local.last_good_sync.is_some());

        let activity = h.activity();
        assert_eq!(activity.len(), 1);
        assert!(activity[0].success);
        assert_eq!(activity[0].message, "Syncing \"primary\" (http://primary.test)");
        assert!(activity[0].sub_id.is_none());
    }

    #[test]
    fn test_cold_sync_every_encoding() {
        let h = Harness::new();
        let mut published = Vec::new();
        for encoding in Encoding::ALL {
            let slice = Slice::new(format!("{encoding}-slice"), SliceType::PiesItems);
            h.primary.create_slice(&slice).unwrap();
            for (key, raw) in [("part-1", "brake pad"), ("part-2", "rotor\n\u{e9}")] {
                let payload = codec::encode(raw.as_bytes(), encoding).unwrap();
                h.primary
                    .create_grain(false, &Grain::new(slice.id, key, encoding, payload))
                    .unwrap();
            }
            let sub = Subscription::new(slice.id, h.partner_id, format!("{encoding}-sub"));
            h.primary
                .add_subscription(&sub, &h.primary.slice(slice.id).unwrap())
                .unwrap();
            published.push((encoding, slice.id));
        }

        let report = h.sync();
        assert_eq!(report.errors(), 0);
        assert_eq!(report.slices.len(), Encoding::ALL.len());
        for (encoding, slice_id) in published {
            assert_converged(&h, slice_id);
            for grain in h.secondary.grains(slice_id, false).unwrap() {
                assert_eq!(grain.encoding, encoding);
                let decoded = codec::decode(grain.payload.as_deref().unwrap(), encoding).unwrap();
                let expected = if grain.grain_key == "part-1" { "brake pad" } else { "rotor\n\u{e9}" };
                assert_eq!(decoded, expected.as_bytes(), "{encoding} {}", grain.grain_key);
            }
        }
    }

    #[test]
    fn test_unrefreshed_slice_syncs_on_new_subscription() {
        let h = Harness::new();
        let mut slice = Slice::new("unrefreshed", SliceType::AcesFile);
        slice.metadata.insert("region".to_string(), "us".to_string());
        h.primary.create_slice(&slice).unwrap();
        h.put(slice.id, "g1", "aa");
        let sub = Subscription::new(slice.id, h.partner_id, "unrefreshed-sub");
        h.primary
            .add_subscription(&sub, &h.primary.slice(slice.id).unwrap())
            .unwrap();

        let report = h.sync();
        let s = &report.slices[0];
        assert_eq!(s.error, None);
        assert!(!s.unchanged);
        assert_eq!(s.added, 1);
        assert!(s.metadata_changed);
        assert_converged(&h, slice.id);
        assert_eq!(h.secondary.slice(slice.id).unwrap().metadata["region"], "us");
    }

    #[test]
    fn test_empty_slice_is_fetched_once() {
        let h = Harness::new();
        let mut slice = Slice::new("empty", SliceType::AcesFile);
        slice.metadata.insert("region".to_string(), "eu".to_string());
        h.primary.create_slice(&slice).unwrap();
        let sub = Subscription::new(slice.id, h.partner_id, "empty-sub");
        h.primary.add_subscription(&sub, &slice).unwrap();

        let first = h.sync();
        assert!(!first.slices[0].unchanged);
        assert!(first.slices[0].metadata_changed);
        assert_converged(&h, slice.id);
        assert!(h.sync().slices[0].unchanged);
    }

    #[test]
    fn test_hash_mismatch_is_per_slice_error() {
        let h = Harness::new();
        let (forged, forged_sub) = h.publish("forged", &[("g1", "aa")]);
        let (good, _) = h.publish("good", &[("g1", "bb")]);
        h.forge(forged.id, "not-a-digest");

        let report = h.sync();
        assert_eq!(report.errors(), 1);
        let failed = report.slices.iter().find(|s| s.slice_id == forged.id).unwrap();
        let message = failed.error.as_deref().unwrap();
        assert!(
            message.starts_with("hash mismatch: expected not-a-digest"),
            "{message}"
        );
        assert_eq!(h.secondary.slice(forged.id).unwrap().sync_status, SyncStatus::Error);
        assert_converged(&h, good.id);

        let activity = h.activity();
        let slice_row = activity.iter().find(|a| a.sub_id == Some(forged_sub.sub_id)).unwrap();
        assert!(!slice_row.success);
        assert!(slice_row.message.contains("hash mismatch"));
        let session_row = activity.iter().find(|a| a.sub_id.is_none()).unwrap();
        assert!(session_row.success);

        // an honest primary heals it on the next run
        h.forged.lock().unwrap().clear();
        let report = h.sync();
        assert_eq!(report.errors(), 0);
        assert_converged(&h, forged.id);
        assert_eq!(h.secondary.slice(forged.id).unwrap().sync_status, SyncStatus::Success);
    }

    #[test]
    fn test_deactivation_by_primary() {
        let h = Harness::new();
        let (slice, sub) = h.publish("S2", &[("g1", "aa")]);
        h.sync();

        h.primary.deactivate_subscription(sub.sub_id).unwrap();
        h.put(slice.id, "g2", "bb");
        h.primary.refresh_slice(slice.id).unwrap();
        h.calls.reset();

        let report = h.sync();
        assert_eq!(report.deactivated, vec![sub.sub_id]);
        assert!(report.slices.is_empty());
        assert_eq!(h.calls.transfers(), (0, 0));

        let local = &h.secondary.subscriptions(h.primary_id).unwrap()[0];
        assert!(!local.active);
        assert_eq!(Harness::grains_on(&h.secondary, slice.id).len(), 1);

        let activity = h.activity();
        assert_eq!(activity.len(), 3);
        let deactivated = activity
            .iter()
            .find(|a| a.message.contains("deactivated by primary"))
            .unwrap();
        assert_eq!(deactivated.sub_id, Some(sub.sub_id));
        assert!(deactivated.success);

        // once is enough
        h.sync();
        assert_eq!(
            h.activity()
                .iter()
                .filter(|a| a.message.contains("deactivated by primary"))
                .count(),
            1
        );
    }

    #[test]
    fn test_partial_change() {
        let h = Harness::new();
        let (slice, _) = h.publish("S3", &[("k1", "1"), ("k2", "2"), ("k3", "3")]);
        h.sync();

        h.remove(slice.id, "k2");
        h.remove(slice.id, "k3");
        h.put(slice.id, "k4", "4");
        let mut updated = h.primary.slice(slice.id).unwrap();
        updated.metadata.insert("release".to_string(), "2".to_string());
        h.primary.update_slice(&updated).unwrap();
        h.primary.refresh_slice(slice.id).unwrap();
        h.calls.reset();

        let report = h.sync();
        let s = &report.slices[0];
        assert_eq!(s.error, None);
        assert_eq!((s.added, s.deleted), (1, 2));
        assert!(s.metadata_changed);
        assert_eq!(h.calls.transfers(), (1, 1));
        assert_converged(&h, slice.id);

        let keys: Vec<String> = Harness::grains_on(&h.secondary, slice.id).into_keys().collect();
        assert_eq!(keys, vec!["k1", "k4"]);
    }

    #[test]
    fn test_locked_slice_is_skipped_and_logged() {
        let h = Harness::new();
        let (locked, locked_sub) = h.publish("S4", &[("g1", "aa")]);
        let (open, _) = h.publish("S4-open", &[("g1", "aa")]);
        h.primary.lock_slice(locked.id).unwrap();

        let report = h.sync();
        let failed = report.slices.iter().find(|s| s.slice_id == locked.id).unwrap();
        assert!(failed.error.as_deref().unwrap().starts_with("slice locked"));
        assert!(Harness::grains_on(&h.secondary, locked.id).is_empty());
        assert_converged(&h, open.id);
        assert_eq!(h.calls.transfers(), (1, 1));

        let activity = h.activity();
        assert_eq!(activity.len(), 2);
        let slice_row = activity.iter().find(|a| a.sub_id == Some(locked_sub.sub_id)).unwrap();
        assert!(!slice_row.success);
        assert!(slice_row.message.contains("slice locked"));
        let session_row = activity.iter().find(|a| a.sub_id.is_none()).unwrap();
        assert!(session_row.success);

        h.primary.unlock_slice(locked.id).unwrap();
        h.sync();
        assert_converged(&h, locked.id);
    }

    #[test]
    fn test_hash_match_short_circuits() {
        let h = Harness::new();
        let (slice, _) = h.publish("S5", &[("g1", "aa"), ("g2", "bb")]);
        h.sync();
        let before = h.secondary.grains(slice.id, false).unwrap();
        h.calls.reset();

        let report = h.sync();
        assert!(report.slices[0].unchanged);
        assert_eq!(report.slices[0].added + report.slices[0].deleted, 0);
        assert!(!report.slices[0].metadata_changed);
        assert_eq!(h.calls.transfers(), (0, 0));
        assert_eq!(h.secondary.grains(slice.id, false).unwrap(), before);
    }

    #[test]
    fn test_new_subscription_mid_life() {
        let h = Harness::new();
        h.publish("first", &[("a", "1")]);
        h.sync();

        let (added, sub) = h.publish("S6", &[("b", "2"), ("c", "3")]);
        let report = h.sync();
        let s = report.slices.iter().find(|s| s.sub_id == sub.sub_id).unwrap();
        assert_eq!(s.added, 2);
        assert!(s.metadata_changed);
        assert_converged(&h, added.id);
        assert_eq!(h.secondary.subscriptions(h.primary_id).unwrap().len(), 2);
    }

    #[test]
    fn test_local_opt_out_is_kept() {
        let h = Harness::new();
        let (slice, sub) = h.publish("mine", &[("a", "1")]);
        h.sync();
        h.secondary.deactivate_subscription(sub.sub_id).unwrap();
        h.put(slice.id, "b", "2");
        h.primary.refresh_slice(slice.id).unwrap();
        h.calls.reset();

        let report = h.sync();
        assert!(report.slices.is_empty());
        assert!(report.deactivated.is_empty());
        assert_eq!(h.calls.transfers(), (0, 0));
        assert!(!h.secondary.subscriptions(h.primary_id).unwrap()[0].active);
    }

    #[test]
    fn test_replaced_grain_syncs() {
        let h = Harness::new();
        let (slice, _) = h.publish("replace", &[("logo", "v1")]);
        h.sync();

        h.put(slice.id, "logo", "v2");
        h.primary.refresh_slice(slice.id).unwrap();
        let report = h.sync();
        assert_eq!((report.slices[0].added, report.slices[0].deleted), (1, 1));
        assert_eq!(Harness::grains_on(&h.secondary, slice.id)["logo"], "v2");
        assert_converged(&h, slice.id);
    }

    #[test]
    fn test_emptied_slice_syncs() {
        let h = Harness::new();
        let (slice, _) = h.publish("emptied", &[("a", "1"), ("b", "2")]);
        h.sync();

        h.remove(slice.id, "a");
        h.remove(slice.id, "b");
        h.primary.refresh_slice(slice.id).unwrap();
        let report = h.sync();
        assert_eq!(report.slices[0].deleted, 2);
        assert_converged(&h, slice.id);
    }

    #[test]
    fn test_busy_slice_is_per_slice_error() {
        let h = Harness::new();
        let (slice, _) = h.publish("busy", &[("a", "1")]);
        h.sync();
        h.put(slice.id, "b", "2");
        h.primary.refresh_slice(slice.id).unwrap();
        assert!(h.secondary.begin_slice_sync(slice.id).unwrap());

        let report = h.sync();
        assert!(report.slices[0].error.as_deref().unwrap().starts_with("slice busy"));
        assert_eq!(h.activity().iter().filter(|a| !a.success).count(), 1);
    }

    #[test]
    fn test_idempotent_second_run() {
        let h = Harness::new();
        let (a, _) = h.publish("a", &[("x", "1")]);
        let (b, _) = h.publish("b", &[]);
        h.sync();
        let report = h.sync();
        for s in &report.slices {
            assert!(s.unchanged, "{} changed", s.slice_name);
            assert!(!s.metadata_changed);
        }
        assert_converged(&h, a.id);
        assert_converged(&h, b.id);
    }

    #[test]
    fn test_gates_write_no_activity() {
        let h = Harness::with_role(ServerRole::Primary);
        assert!(matches!(
            h.engine.start(&admin(), h.primary_id),
            Err(Error::Forbidden(_))
        ));

        let h = Harness::new();
        let company_admin = CurrentUser {
            role: Role::CompanyAdmin,
            ..admin()
        };
        assert!(matches!(
            h.engine.start(&company_admin, h.primary_id),
            Err(Error::Forbidden(_))
        ));
        assert!(h.activity().is_empty());
    }

    #[test]
    fn test_session_failures_are_logged() {
        let h = Harness::new();
        assert!(matches!(
            h.engine.start(&admin(), Uuid::new_v4()),
            Err(Error::NotFound)
        ));

        let mut primary = h.secondary.company(h.primary_id).unwrap();
        primary.sync_api_key = Credentials::new(SYNC_USER, "wrong")
            .encrypt(&SyncKey::generate())
            .unwrap();
        h.secondary.update_company(&primary).unwrap();
        assert!(matches!(
            h.engine.start(&admin(), h.primary_id),
            Err(Error::Crypto(_))
        ));

        let activity = h.activity();
        assert_eq!(activity.len(), 2);
        assert!(activity.iter().all(|a| !a.success));
        assert!(activity[0].message.starts_with("Syncing \"primary\" (http://primary.test): "));
    }

    #[test]
    fn test_bad_login_is_fatal() {
        let h = Harness::new();
        let key = h.engine.key.clone().unwrap();
        let mut primary = h.secondary.company(h.primary_id).unwrap();
        primary.sync_api_key = Credentials::new(SYNC_USER, "wrong").encrypt(&key).unwrap();
        h.secondary.update_company(&primary).unwrap();

        assert!(matches!(
            h.engine.start(&admin(), h.primary_id),
            Err(Error::InvalidCredentials)
        ));
        assert_eq!(h.activity().len(), 1);
    }

    #[test]
    fn test_inactive_primary_is_refused() {
        let h = Harness::new();
        let mut primary = h.secondary.company(h.primary_id).unwrap();
        primary.active = false;
        h.secondary.update_company(&primary).unwrap();

        assert!(matches!(
            h.engine.start(&admin(), h.primary_id),
            Err(Error::Forbidden(_))
        ));
    }
}
