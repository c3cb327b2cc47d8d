//! Port manager orchestration.
//!
//! [`PortManager`] ties the mapping store, the reservation table, and the
//! rule installer together. Adding mappings is transactional: the record is
//! staged, every rule installed, and only then committed; any failure rolls
//! everything back so the manager ends in its exact pre-call state. Removal
//! is best-effort: every rule teardown is attempted, the record always goes
//! away, and leftover rules are reported.

use std::collections::HashMap;
use std::path::PathBuf;

use lotse_common::{ContainerId, LotseError, LotseResult};
use parking_lot::Mutex;

use crate::mapping::{MappingRecord, PortMapping};
use crate::reserve::ReservationTable;
use crate::rules::{IptablesInstaller, RuleHandle, RuleInstaller};
use crate::store::MappingStore;

/// Manages persistent port mappings and their forwarding rules.
///
/// All operations serialize on one internal lock, so the store, the
/// reservation table, and the rule handle cache always mutate as a unit.
/// The handle is safe to share between threads.
pub struct PortManager {
    inner: Mutex<Inner>,
}

struct Inner {
    store: MappingStore,
    reservations: ReservationTable,
    handles: HashMap<ContainerId, Vec<RuleHandle>>,
    installer: Box<dyn RuleInstaller>,
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager").finish_non_exhaustive()
    }
}

impl PortManager {
    /// Open a port manager over `storage_path` with the iptables installer.
    ///
    /// Loads all persisted records, rebuilds the reservation table and the
    /// rule handles for every committed record.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, lock contention ([`LotseError::Locked`]), or
    /// corrupted storage ([`LotseError::Corrupted`]).
    pub fn new(storage_path: impl Into<PathBuf>) -> LotseResult<Self> {
        Self::with_installer(storage_path, Box::new(IptablesInstaller::new()))
    }

    /// Open a port manager with a caller-provided rule installer.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::new`].
    pub fn with_installer(
        storage_path: impl Into<PathBuf>,
        installer: Box<dyn RuleInstaller>,
    ) -> LotseResult<Self> {
        let store = MappingStore::open(storage_path)?;
        let reservations = ReservationTable::from_records(store.root(), store.records())?;

        // A committed record means its rules were installed, so the handles
        // can be rebuilt without touching the installer.
        let mut handles = HashMap::new();
        for record in store.records() {
            let rebuilt: Vec<RuleHandle> = record
                .mappings
                .iter()
                .map(|m| RuleHandle::new(record.id.clone(), record.network.clone(), m.clone()))
                .collect();
            handles.insert(record.id.clone(), rebuilt);
        }

        tracing::info!(
            path = %store.root().display(),
            containers = store.len(),
            reservations = reservations.len(),
            "Port manager ready"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                store,
                reservations,
                handles,
                installer,
            }),
        })
    }

    /// Add port mappings for a container.
    ///
    /// Either the whole batch becomes active (persisted and installed) or
    /// nothing changes: a validation error, a port collision, a storage
    /// failure, or a failed rule install all leave the manager exactly as
    /// it was before the call.
    ///
    /// # Errors
    ///
    /// - [`LotseError::InvalidId`] for a malformed id
    /// - [`LotseError::DuplicateId`] if the id already has mappings
    /// - [`LotseError::EmptyMappingSet`] for an empty batch
    /// - [`LotseError::InvalidMapping`] / [`LotseError::PortInUse`] per batch entry
    /// - [`LotseError::Io`] / [`LotseError::Install`] from storage or the installer
    pub fn add(&self, id: &str, network: &str, mappings: &[PortMapping]) -> LotseResult<()> {
        let id = ContainerId::new(id)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.store.contains(&id) {
            return Err(LotseError::DuplicateId { id: id.to_string() });
        }
        if mappings.is_empty() {
            return Err(LotseError::EmptyMappingSet { id: id.to_string() });
        }
        inner.reservations.check_batch(mappings)?;

        let record = MappingRecord::new(id.clone(), network, mappings.to_vec());
        inner.store.put(&record)?;

        let mut installed: Vec<RuleHandle> = Vec::with_capacity(record.mappings.len());
        for (index, mapping) in record.mappings.iter().enumerate() {
            match inner.installer.install(&id, &record.network, mapping) {
                Ok(handle) => installed.push(handle),
                Err(err) => {
                    tracing::warn!(
                        id = %id,
                        mapping = %mapping,
                        index,
                        error = %err,
                        "Rule install failed, rolling back batch"
                    );
                    rollback(inner.installer.as_ref(), &installed);
                    abort_pending(&mut inner.store, &id);
                    return Err(contextualize_install(err, index, mapping));
                }
            }
        }

        if let Err(err) = inner.store.commit(record.clone()) {
            tracing::warn!(id = %id, error = %err, "Record commit failed, rolling back batch");
            rollback(inner.installer.as_ref(), &installed);
            abort_pending(&mut inner.store, &id);
            return Err(err);
        }

        inner.reservations.reserve(&record);
        inner.handles.insert(id.clone(), installed);

        tracing::info!(
            id = %id,
            network = %record.network,
            mappings = record.mappings.len(),
            "Added port mappings"
        );
        Ok(())
    }

    /// Remove all port mappings for a container.
    ///
    /// Every rule teardown is attempted even if earlier ones fail; the
    /// record and its reservations are removed afterwards regardless.
    /// Rules that could not be torn down surface as
    /// [`LotseError::PartialRemoval`] — the record is gone either way, so a
    /// retried add for the same ports is allowed.
    ///
    /// # Errors
    ///
    /// - [`LotseError::InvalidId`] for a malformed id
    /// - [`LotseError::NotFound`] if the id has no mappings
    /// - [`LotseError::Io`] if the record cannot be deleted (mappings stay tracked)
    /// - [`LotseError::PartialRemoval`] if one or more rules remain
    pub fn remove(&self, id: &str) -> LotseResult<()> {
        let id = ContainerId::new(id)?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(record) = inner.store.get(&id).cloned() else {
            return Err(LotseError::NotFound { id: id.to_string() });
        };

        let handles = inner.handles.remove(&id).unwrap_or_else(|| {
            record
                .mappings
                .iter()
                .map(|m| RuleHandle::new(record.id.clone(), record.network.clone(), m.clone()))
                .collect()
        });

        let mut failures = Vec::new();
        for handle in &handles {
            if let Err(err) = inner.installer.uninstall(handle) {
                tracing::warn!(
                    id = %id,
                    mapping = %handle.mapping,
                    error = %err,
                    "Rule uninstall failed"
                );
                failures.push(format!("{}: {err}", handle.mapping));
            }
        }

        // The record and its reservations go away only after every teardown
        // was attempted, so a retried remove still sees the ports as owned.
        if let Err(err) = inner.store.delete(&id) {
            inner.handles.insert(id.clone(), handles);
            return Err(err);
        }
        inner.reservations.release(&record);

        if failures.is_empty() {
            tracing::info!(id = %id, mappings = record.mappings.len(), "Removed port mappings");
            Ok(())
        } else {
            Err(LotseError::PartialRemoval {
                id: id.to_string(),
                failures,
            })
        }
    }

    /// Whether the container currently has active mappings.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        ContainerId::new(id)
            .map(|id| self.inner.lock().store.contains(&id))
            .unwrap_or(false)
    }

    /// The active mappings for a container, if any.
    #[must_use]
    pub fn mappings(&self, id: &str) -> Option<Vec<PortMapping>> {
        let id = ContainerId::new(id).ok()?;
        self.inner
            .lock()
            .store
            .get(&id)
            .map(|record| record.mappings.clone())
    }

    /// All container IDs with active mappings, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<ContainerId> {
        let inner = self.inner.lock();
        let mut ids: Vec<ContainerId> = inner.store.records().map(|r| r.id.clone()).collect();
        ids.sort();
        ids
    }

    /// Release the storage lock. Idempotent; also happens on drop.
    pub fn close(&self) {
        self.inner.lock().store.close();
    }
}

/// Uninstall a batch's already-installed rules, newest first.
///
/// Rollback is best-effort: a rule that refuses to uninstall is logged and
/// skipped so the remaining rules still get removed.
fn rollback(installer: &dyn RuleInstaller, installed: &[RuleHandle]) {
    for handle in installed.iter().rev() {
        if let Err(err) = installer.uninstall(handle) {
            tracing::warn!(
                id = %handle.id,
                mapping = %handle.mapping,
                error = %err,
                "Failed to uninstall rule during rollback"
            );
        }
    }
}

fn abort_pending(store: &mut MappingStore, id: &ContainerId) {
    if let Err(err) = store.abort(id) {
        tracing::warn!(id = %id, error = %err, "Failed to discard pending record");
    }
}

fn contextualize_install(err: LotseError, index: usize, mapping: &PortMapping) -> LotseError {
    match err {
        LotseError::Install { message } => LotseError::Install {
            message: format!("mapping {index} ({mapping}): {message}"),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Protocol;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Scriptable installer: tracks active rules, can fail the Nth install
    /// or refuse to uninstall a given host port.
    #[derive(Default)]
    struct MockInstaller {
        active: Mutex<Vec<RuleHandle>>,
        installs: Mutex<usize>,
        fail_install_at: Option<usize>,
        fail_uninstall_port: Option<u16>,
    }

    impl MockInstaller {
        fn active_ports(&self) -> Vec<u16> {
            self.active
                .lock()
                .iter()
                .map(|h| h.mapping.host_port)
                .collect()
        }
    }

    impl RuleInstaller for MockInstaller {
        fn install(
            &self,
            id: &ContainerId,
            network: &str,
            mapping: &PortMapping,
        ) -> LotseResult<RuleHandle> {
            let mut installs = self.installs.lock();
            let call = *installs;
            *installs += 1;
            if self.fail_install_at == Some(call) {
                return Err(LotseError::Install {
                    message: "mock install failure".to_string(),
                });
            }

            let handle = RuleHandle::new(id.clone(), network, mapping.clone());
            self.active.lock().push(handle.clone());
            Ok(handle)
        }

        fn uninstall(&self, handle: &RuleHandle) -> LotseResult<()> {
            if self.fail_uninstall_port == Some(handle.mapping.host_port) {
                return Err(LotseError::Install {
                    message: "mock uninstall failure".to_string(),
                });
            }
            self.active.lock().retain(|h| h != handle);
            Ok(())
        }
    }

    fn manager_with(
        path: &std::path::Path,
        mock: &Arc<MockInstaller>,
    ) -> PortManager {
        PortManager::with_installer(path, Box::new(Arc::clone(mock))).unwrap()
    }

    fn tcp(port: u16) -> PortMapping {
        PortMapping::tcp("0.0.0.0", port, 80).unwrap()
    }

    #[test]
    fn add_then_remove_restores_initial_state() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        manager
            .add("c1", "10.88.0.2/16", &[tcp(8080), tcp(8081)])
            .unwrap();
        assert!(manager.contains("c1"));
        assert_eq!(mock.active_ports(), vec![8080, 8081]);

        manager.remove("c1").unwrap();
        assert!(!manager.contains("c1"));
        assert!(mock.active_ports().is_empty());
        assert!(manager.ids().is_empty());
        assert!(!temp.path().join("c1.json").exists());
    }

    #[test]
    fn conflicting_add_leaves_no_trace() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        manager.add("c1", "10.88.0.2/16", &[tcp(8080)]).unwrap();
        let err = manager
            .add("c2", "10.88.0.3/16", &[tcp(8080)])
            .unwrap_err();
        assert!(matches!(err, LotseError::PortInUse { .. }));

        assert!(!manager.contains("c2"));
        assert_eq!(mock.active_ports(), vec![8080]);
        assert!(!temp.path().join("c2.json").exists());
        assert!(!temp.path().join("c2.json.pending").exists());
    }

    #[test]
    fn freed_port_is_reusable() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        manager.add("c1", "10.88.0.2/16", &[tcp(8080)]).unwrap();
        assert!(manager.add("c2", "10.88.0.3/16", &[tcp(8080)]).is_err());

        manager.remove("c1").unwrap();
        manager.add("c2", "10.88.0.3/16", &[tcp(8080)]).unwrap();
        assert!(manager.contains("c2"));
    }

    #[test]
    fn empty_mapping_set_is_rejected() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        let err = manager.add("c1", "10.88.0.2/16", &[]).unwrap_err();
        assert!(matches!(err, LotseError::EmptyMappingSet { .. }));
        assert!(manager.ids().is_empty());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1); // only .lock
    }

    #[test]
    fn duplicate_id_is_rejected_without_side_effects() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        manager.add("c1", "10.88.0.2/16", &[tcp(8080)]).unwrap();
        let err = manager.add("c1", "10.88.0.2/16", &[tcp(9090)]).unwrap_err();
        assert!(matches!(err, LotseError::DuplicateId { .. }));
        assert_eq!(mock.active_ports(), vec![8080]);
    }

    #[test]
    fn invalid_id_is_rejected() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        assert!(matches!(
            manager.add("", "10.88.0.2/16", &[tcp(8080)]).unwrap_err(),
            LotseError::InvalidId { .. }
        ));
        assert!(matches!(
            manager.add("bad/id", "10.88.0.2/16", &[tcp(8080)]).unwrap_err(),
            LotseError::InvalidId { .. }
        ));
    }

    #[test]
    fn zero_host_port_is_rejected() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        let mut mapping = tcp(8080);
        mapping.host_port = 0;
        let err = manager.add("c1", "10.88.0.2/16", &[mapping]).unwrap_err();
        assert!(matches!(err, LotseError::InvalidMapping { index: 0, .. }));
        assert!(mock.active_ports().is_empty());
    }

    #[test]
    fn failed_install_rolls_back_batch() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller {
            fail_install_at: Some(1),
            ..Default::default()
        });
        let manager = manager_with(temp.path(), &mock);

        let err = manager
            .add("c1", "10.88.0.2/16", &[tcp(8080), tcp(8081)])
            .unwrap_err();
        assert!(matches!(err, LotseError::Install { .. }));
        assert!(err.to_string().contains("mapping 1"));

        // The first rule was uninstalled again and nothing persisted.
        assert!(mock.active_ports().is_empty());
        assert!(!manager.contains("c1"));
        assert!(!temp.path().join("c1.json").exists());
        assert!(!temp.path().join("c1.json.pending").exists());

        // The ports are free for a retry.
        manager
            .add("c1", "10.88.0.2/16", &[tcp(8080), tcp(8081)])
            .unwrap();
        assert_eq!(mock.active_ports(), vec![8080, 8081]);
    }

    #[test]
    fn partial_uninstall_still_removes_record() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller {
            fail_uninstall_port: Some(8081),
            ..Default::default()
        });
        let manager = manager_with(temp.path(), &mock);

        manager
            .add("c1", "10.88.0.2/16", &[tcp(8080), tcp(8081)])
            .unwrap();

        let err = manager.remove("c1").unwrap_err();
        match err {
            LotseError::PartialRemoval { id, failures } => {
                assert_eq!(id, "c1");
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("8081"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // Record and reservations are gone despite the stuck rule.
        assert!(!manager.contains("c1"));
        assert!(manager.add("c2", "10.88.0.3/16", &[tcp(8080)]).is_ok());
    }

    #[test]
    fn remove_unknown_id_fails() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        let err = manager.remove("ghost").unwrap_err();
        assert!(matches!(err, LotseError::NotFound { .. }));
    }

    #[test]
    fn mappings_returns_submitted_order() {
        let temp = tempdir().unwrap();
        let mock = Arc::new(MockInstaller::default());
        let manager = manager_with(temp.path(), &mock);

        let batch = vec![
            tcp(9090),
            tcp(8080),
            PortMapping {
                host_address: "0.0.0.0".parse().unwrap(),
                host_port: 8080,
                container_port: 53,
                protocol: Protocol::Udp,
            },
        ];
        manager.add("c1", "10.88.0.2/16", &batch).unwrap();
        assert_eq!(manager.mappings("c1").unwrap(), batch);
        assert!(manager.mappings("ghost").is_none());
    }
}
