use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::guardrail::UID_MAP_BYTE_BUDGET;

/// Everything tracked for one `(uid, package)` pair.
#[derive(Debug, Clone, Default)]
pub struct AppData {
    pub version: i64,
    pub version_string: String,
    pub installer: String,
    pub deleted: bool,
    pub certificate_hash: Vec<u8>,
}

/// A pending add/update/remove awaiting the next report.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub deletion: bool,
    pub ts_ns: i64,
    pub package: String,
    pub uid: i32,
    pub version: i64,
    pub prev_version: i64,
}

impl ChangeRecord {
    fn byte_size(&self) -> usize {
        std::mem::size_of::<ChangeRecord>() + self.package.len()
    }
}

/// Snapshot row exposed to reports.
#[derive(Debug, Clone, Serialize)]
pub struct PackageInfo {
    pub package: String,
    pub uid: i32,
    pub version: i64,
    pub installer: String,
    pub deleted: bool,
}

#[derive(Default)]
struct Inner {
    map: HashMap<(i32, String), AppData>,
    isolated: HashMap<i32, i32>,
    changes: VecDeque<ChangeRecord>,
    changes_bytes: usize,
    max_bytes: usize,
}

/// Tracks package name and version per uid for attribution, plus the change
/// records shipped with reports.
///
/// Isolated uids fold into their host uid so metrics attribute to the app.
/// Pending change records live under a byte budget: oldest entries drop
/// first when the budget is exceeded.
pub struct UidMap {
    inner: Mutex<Inner>,
}

impl Default for UidMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UidMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_bytes: UID_MAP_BYTE_BUDGET,
                ..Inner::default()
            }),
        }
    }

    /// Test hook: shrink the change-record byte budget.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        self.inner.lock().max_bytes = max_bytes;
    }

    /// Records an app install or upgrade. Returns true when this was an
    /// upgrade of an already-known `(uid, package)`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_app(
        &self,
        ts_ns: i64,
        package: &str,
        uid: i32,
        version: i64,
        version_string: &str,
        installer: &str,
        certificate_hash: &[u8],
    ) -> bool {
        let mut inner = self.inner.lock();
        let key = (uid, package.to_string());
        let prev = inner.map.get(&key).filter(|d| !d.deleted).cloned();
        let prev_version = prev.as_ref().map(|d| d.version).unwrap_or(0);
        inner.map.insert(
            key,
            AppData {
                version,
                version_string: version_string.to_string(),
                installer: installer.to_string(),
                deleted: false,
                certificate_hash: certificate_hash.to_vec(),
            },
        );
        let record = ChangeRecord {
            deletion: false,
            ts_ns,
            package: package.to_string(),
            uid,
            version,
            prev_version,
        };
        inner.changes_bytes += record.byte_size();
        inner.changes.push_back(record);
        Self::ensure_bytes_below_limit(&mut inner);
        debug!(package, uid, version, "app updated");
        prev.is_some()
    }

    /// Marks an app removed. The entry is retained (tombstoned) so late
    /// events still attribute.
    pub fn remove_app(&self, ts_ns: i64, package: &str, uid: i32) {
        let mut inner = self.inner.lock();
        let key = (uid, package.to_string());
        let prev_version = inner.map.get(&key).map(|d| d.version).unwrap_or(0);
        if let Some(data) = inner.map.get_mut(&key) {
            data.deleted = true;
        }
        let record = ChangeRecord {
            deletion: true,
            ts_ns,
            package: package.to_string(),
            uid,
            version: prev_version,
            prev_version,
        };
        inner.changes_bytes += record.byte_size();
        inner.changes.push_back(record);
        Self::ensure_bytes_below_limit(&mut inner);
    }

    fn ensure_bytes_below_limit(inner: &mut Inner) {
        while inner.changes_bytes > inner.max_bytes {
            let Some(oldest) = inner.changes.pop_front() else {
                break;
            };
            inner.changes_bytes -= oldest.byte_size();
        }
    }

    pub fn assign_isolated_uid(&self, isolated_uid: i32, parent_uid: i32) {
        self.inner.lock().isolated.insert(isolated_uid, parent_uid);
    }

    pub fn remove_isolated_uid(&self, isolated_uid: i32) {
        self.inner.lock().isolated.remove(&isolated_uid);
    }

    /// The host uid for an isolated uid, or the uid itself.
    pub fn get_host_uid_or_self(&self, uid: i32) -> i32 {
        self.inner.lock().isolated.get(&uid).copied().unwrap_or(uid)
    }

    pub fn has_app(&self, uid: i32, package: &str) -> bool {
        self.inner
            .lock()
            .map
            .get(&(uid, package.to_string()))
            .map(|d| !d.deleted)
            .unwrap_or(false)
    }

    pub fn get_app_version(&self, uid: i32, package: &str) -> Option<i64> {
        self.inner
            .lock()
            .map
            .get(&(uid, package.to_string()))
            .map(|d| d.version)
    }

    /// All package names installed under `uid`.
    pub fn get_app_names_from_uid(&self, uid: i32, normalize: bool) -> HashSet<String> {
        self.inner
            .lock()
            .map
            .iter()
            .filter(|((u, _), data)| *u == uid && !data.deleted)
            .map(|((_, package), _)| {
                if normalize {
                    package.to_lowercase()
                } else {
                    package.clone()
                }
            })
            .collect()
    }

    /// Pending change records; `clear` drains them after a report upload.
    pub fn change_records(&self, clear: bool) -> Vec<ChangeRecord> {
        let mut inner = self.inner.lock();
        let records: Vec<ChangeRecord> = inner.changes.iter().cloned().collect();
        if clear {
            inner.changes.clear();
            inner.changes_bytes = 0;
        }
        records
    }

    /// A full snapshot of the current package state.
    pub fn snapshot(&self) -> Vec<PackageInfo> {
        let inner = self.inner.lock();
        let mut rows: Vec<PackageInfo> = inner
            .map
            .iter()
            .map(|((uid, package), data)| PackageInfo {
                package: package.clone(),
                uid: *uid,
                version: data.version,
                installer: data.installer.clone(),
                deleted: data.deleted,
            })
            .collect();
        rows.sort_by(|a, b| (a.uid, &a.package).cmp(&(b.uid, &b.package)));
        rows
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().changes_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_upgrade() {
        let map = UidMap::new();
        assert!(!map.update_app(10, "com.example.app", 10001, 1, "1.0", "store", &[]));
        assert!(map.update_app(20, "com.example.app", 10001, 2, "2.0", "store", &[]));
        assert_eq!(map.get_app_version(10001, "com.example.app"), Some(2));

        let records = map.change_records(false);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].prev_version, 1);
    }

    #[test]
    fn test_removed_app_retained_as_tombstone() {
        let map = UidMap::new();
        map.update_app(10, "com.example.app", 10001, 1, "1.0", "store", &[]);
        map.remove_app(20, "com.example.app", 10001);

        assert!(!map.has_app(10001, "com.example.app"));
        // Version still resolvable for late attribution.
        assert_eq!(map.get_app_version(10001, "com.example.app"), Some(1));
        assert!(map.get_app_names_from_uid(10001, false).is_empty());
    }

    #[test]
    fn test_shared_uid_lists_all_packages() {
        let map = UidMap::new();
        map.update_app(10, "com.example.One", 10001, 1, "1", "", &[]);
        map.update_app(10, "com.example.Two", 10001, 1, "1", "", &[]);
        map.update_app(10, "com.other", 10002, 1, "1", "", &[]);

        let names = map.get_app_names_from_uid(10001, false);
        assert_eq!(names.len(), 2);
        assert!(names.contains("com.example.One"));

        let normalized = map.get_app_names_from_uid(10001, true);
        assert!(normalized.contains("com.example.one"));
    }

    #[test]
    fn test_isolated_uid_folds_to_host() {
        let map = UidMap::new();
        map.assign_isolated_uid(99001, 10001);
        assert_eq!(map.get_host_uid_or_self(99001), 10001);
        assert_eq!(map.get_host_uid_or_self(10001), 10001);
        map.remove_isolated_uid(99001);
        assert_eq!(map.get_host_uid_or_self(99001), 99001);
    }

    #[test]
    fn test_memory_guardrail_drops_oldest_changes() {
        let map = UidMap::new();
        map.set_max_bytes(3 * (std::mem::size_of::<ChangeRecord>() + 11));

        for i in 0..10 {
            map.update_app(i, "com.example.a", 10001, i, "v", "", &[]);
        }
        let records = map.change_records(false);
        assert!(records.len() <= 3);
        // The newest records survive.
        assert_eq!(records.last().map(|r| r.ts_ns), Some(9));
        assert!(map.bytes_used() <= map.inner.lock().max_bytes);
    }

    #[test]
    fn test_change_records_cleared_after_upload() {
        let map = UidMap::new();
        map.update_app(10, "com.example.app", 10001, 1, "1", "", &[]);
        assert_eq!(map.change_records(true).len(), 1);
        assert!(map.change_records(false).is_empty());
        assert_eq!(map.bytes_used(), 0);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let map = UidMap::new();
        map.update_app(10, "b.pkg", 10002, 1, "1", "", &[]);
        map.update_app(10, "a.pkg", 10001, 1, "1", "", &[]);
        let snap = map.snapshot();
        assert_eq!(snap[0].uid, 10001);
        assert_eq!(snap[1].package, "b.pkg");
    }
}
