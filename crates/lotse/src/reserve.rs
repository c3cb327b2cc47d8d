//! Host port reservation tracking.
//!
//! The reservation table is the in-memory conflict-detection structure: it
//! maps every claimed `(host address, host port, protocol)` tuple to the
//! container owning it. It is derived state, rebuilt from the mapping store
//! on startup, and is only ever mutated together with the store.

use std::collections::HashMap;

use lotse_common::{ContainerId, LotseError, LotseResult};

use crate::mapping::{MappingRecord, PortKey, PortMapping};

/// Tracks which container owns each claimed host port tuple.
#[derive(Debug, Default)]
pub struct ReservationTable {
    claims: HashMap<PortKey, ContainerId>,
}

impl ReservationTable {
    /// Create an empty reservation table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The container currently owning `key`, if any.
    #[must_use]
    pub fn owner(&self, key: &PortKey) -> Option<&ContainerId> {
        self.claims.get(key)
    }

    /// Number of claimed tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether no tuples are claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Validate a mapping batch against the table before reserving.
    ///
    /// First rejects malformed entries (zero host port, intra-batch
    /// duplicate tuples), then checks every tuple against existing claims.
    /// The error identifies the first offending mapping by its position in
    /// the batch.
    ///
    /// # Errors
    ///
    /// Returns [`LotseError::InvalidMapping`] or [`LotseError::PortInUse`].
    pub fn check_batch(&self, mappings: &[PortMapping]) -> LotseResult<()> {
        let mut seen: HashMap<PortKey, usize> = HashMap::with_capacity(mappings.len());

        for (index, mapping) in mappings.iter().enumerate() {
            if mapping.host_port == 0 {
                return Err(LotseError::InvalidMapping {
                    index,
                    reason: "host port must be non-zero".to_string(),
                });
            }

            let key = mapping.key();
            if let Some(previous) = seen.insert(key, index) {
                return Err(LotseError::InvalidMapping {
                    index,
                    reason: format!("duplicates mapping at index {previous} ({key})"),
                });
            }
        }

        for mapping in mappings {
            let key = mapping.key();
            if let Some(owner) = self.claims.get(&key) {
                return Err(LotseError::PortInUse {
                    address: key.address,
                    port: key.port,
                    protocol: key.protocol.to_string(),
                    owner: owner.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Claim every tuple of `record` for its container.
    ///
    /// Callers must have validated the batch with [`Self::check_batch`]
    /// first; claiming an already-owned tuple is a logic error and panics
    /// in debug builds.
    pub fn reserve(&mut self, record: &MappingRecord) {
        for mapping in &record.mappings {
            let previous = self.claims.insert(mapping.key(), record.id.clone());
            debug_assert!(previous.is_none(), "tuple reserved twice: {}", mapping.key());
        }
    }

    /// Release every tuple owned by `record`'s container.
    pub fn release(&mut self, record: &MappingRecord) {
        for mapping in &record.mappings {
            self.claims.remove(&mapping.key());
        }
    }

    /// Rebuild a table from persisted records, treating overlap as corruption.
    ///
    /// # Errors
    ///
    /// Returns [`LotseError::Corrupted`] if two records claim the same tuple.
    pub fn from_records<'a>(
        storage: &std::path::Path,
        records: impl IntoIterator<Item = &'a MappingRecord>,
    ) -> LotseResult<Self> {
        let mut table = Self::new();

        for record in records {
            for mapping in &record.mappings {
                let key = mapping.key();
                if let Some(owner) = table.claims.get(&key) {
                    return Err(LotseError::Corrupted {
                        path: storage.to_path_buf(),
                        message: format!(
                            "containers {owner} and {} both claim {key}",
                            record.id
                        ),
                    });
                }
                table.claims.insert(key, record.id.clone());
            }
        }

        Ok(table)
    }
}
