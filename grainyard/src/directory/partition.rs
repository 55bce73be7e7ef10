//! The authoritative local slice of the grain registry.

use grainyard_core::{ActivationId, GrainAddress, GrainId, SiloAddress};
use std::collections::HashMap;
use std::time::Instant;

/// One registered activation inside a grain-info entry.
#[derive(Debug, Clone)]
pub struct ActivationEntry {
    pub activation: ActivationId,
    pub silo: SiloAddress,
    pub registered_at: Instant,
}

/// Directory state for one grain identity.
///
/// Activations are kept in insertion order; the etag changes on every
/// mutation of the entry.
#[derive(Debug, Clone)]
pub struct GrainInfo {
    activations: Vec<ActivationEntry>,
    etag: u64,
}

impl GrainInfo {
    fn new(etag: u64) -> Self {
        Self {
            activations: Vec::new(),
            etag,
        }
    }

    pub fn etag(&self) -> u64 {
        self.etag
    }

    pub fn activations(&self) -> &[ActivationEntry] {
        &self.activations
    }

    fn addresses(&self, grain: &GrainId) -> Vec<GrainAddress> {
        self.activations
            .iter()
            .map(|entry| GrainAddress::new(entry.silo.clone(), grain.clone(), entry.activation))
            .collect()
    }
}

/// Outcome of a single-activation registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// The winning address — the caller's own when it won the race, the
    /// previously-registered one when it lost.
    pub address: GrainAddress,
    /// Entry etag after the operation.
    pub etag: u64,
}

/// Partition of the grain directory owned by this silo.
///
/// Holds authoritative entries for every grain identity whose hash falls in
/// this silo's ring range. Single-writer: all mutation happens through the
/// directory system target on the silo thread, so operations on one grain
/// identity are naturally serialized.
///
/// # Invariants
///
/// - The etag counter strictly increases on every mutation; equal etags
///   imply no observable change in between
/// - At most one activation per grain identity in single-activation mode
/// - `add_single_activation` is idempotent for retries carrying the same
///   `(grain, activation)` pair
#[derive(Debug, Default)]
pub struct GrainDirectoryPartition {
    entries: HashMap<GrainId, GrainInfo>,
    next_etag: u64,
}

impl GrainDirectoryPartition {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_etag(&mut self) -> u64 {
        self.next_etag += 1;
        self.next_etag
    }

    /// Register a single-activation grain; first writer wins.
    ///
    /// If an entry already exists with a *different* activation id, the
    /// existing address is returned unchanged and the caller must
    /// garbage-collect its losing activation. Re-registering the identical
    /// `(grain, activation)` pair returns the same winner without growing
    /// the entry.
    pub fn add_single_activation(&mut self, address: GrainAddress) -> RegistrationResult {
        if let Some(info) = self.entries.get(&address.grain) {
            if let Some(existing) = info.activations.first() {
                if existing.activation == address.activation && existing.silo == address.silo {
                    // Idempotent retry.
                    return RegistrationResult {
                        address,
                        etag: info.etag,
                    };
                }
                // Caller lost the race.
                return RegistrationResult {
                    address: GrainAddress::new(
                        existing.silo.clone(),
                        address.grain.clone(),
                        existing.activation,
                    ),
                    etag: info.etag,
                };
            }
        }

        let etag = self.bump_etag();
        let info = self
            .entries
            .entry(address.grain.clone())
            .or_insert_with(|| GrainInfo::new(etag));
        info.activations.push(ActivationEntry {
            activation: address.activation,
            silo: address.silo.clone(),
            registered_at: Instant::now(),
        });
        info.etag = etag;
        RegistrationResult { address, etag }
    }

    /// Append an activation (multi-activation mode).
    pub fn add_activation(&mut self, address: GrainAddress) -> u64 {
        let etag = self.bump_etag();
        let info = self
            .entries
            .entry(address.grain.clone())
            .or_insert_with(|| GrainInfo::new(etag));
        if !info
            .activations
            .iter()
            .any(|e| e.activation == address.activation)
        {
            info.activations.push(ActivationEntry {
                activation: address.activation,
                silo: address.silo,
                registered_at: Instant::now(),
            });
            info.etag = etag;
        }
        info.etag
    }

    /// Remove one activation; no-op when absent. Bumps the etag on change.
    pub fn remove_activation(&mut self, grain: &GrainId, activation: ActivationId) -> bool {
        let etag = self.next_etag + 1;
        let Some(info) = self.entries.get_mut(grain) else {
            return false;
        };
        let before = info.activations.len();
        info.activations.retain(|e| e.activation != activation);
        if info.activations.len() == before {
            return false;
        }
        info.etag = etag;
        self.next_etag = etag;
        if self
            .entries
            .get(grain)
            .map(|i| i.activations.is_empty())
            .unwrap_or(false)
        {
            self.entries.remove(grain);
        }
        true
    }

    /// Current activation list and etag for a grain.
    pub fn lookup(&self, grain: &GrainId) -> Option<(Vec<GrainAddress>, u64)> {
        self.entries
            .get(grain)
            .map(|info| (info.addresses(grain), info.etag))
    }

    /// Remove all entries for a grain.
    pub fn delete(&mut self, grain: &GrainId) -> bool {
        if self.entries.remove(grain).is_some() {
            self.bump_etag();
            true
        } else {
            false
        }
    }

    /// Full snapshot of all registered addresses, for handoff.
    pub fn get_items(&self) -> Vec<GrainAddress> {
        self.entries
            .iter()
            .flat_map(|(grain, info)| info.addresses(grain))
            .collect()
    }

    /// Addresses whose grain identity satisfies `filter`, without removal.
    ///
    /// Used to compute a handoff split; entries leave the partition only
    /// after the receiver acknowledged them (`remove_many`).
    pub fn collect_where(&self, mut filter: impl FnMut(&GrainId) -> bool) -> Vec<GrainAddress> {
        self.entries
            .iter()
            .filter(|(grain, _)| filter(grain))
            .flat_map(|(grain, info)| info.addresses(grain))
            .collect()
    }

    /// Remove a batch of previously-collected addresses.
    pub fn remove_many(&mut self, addresses: &[GrainAddress]) {
        for address in addresses {
            self.remove_activation(&address.grain, address.activation);
        }
    }

    /// Drop every entry pointing at `silo`; returns how many activations
    /// were scrubbed.
    ///
    /// Called when membership declares a silo Dead — its activations are
    /// gone with it.
    pub fn scrub_silo(&mut self, silo: &SiloAddress) -> usize {
        let doomed: Vec<(GrainId, ActivationId)> = self
            .entries
            .iter()
            .flat_map(|(grain, info)| {
                info.activations
                    .iter()
                    .filter(|e| &e.silo == silo)
                    .map(|e| (grain.clone(), e.activation))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (grain, activation) in &doomed {
            self.remove_activation(grain, *activation);
        }
        doomed.len()
    }

    /// Wipe the partition after handoff completed.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of grain identities with at least one registration.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
