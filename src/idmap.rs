//! Bidirectional id map between a simulation's proxy ids and the viewer's.
//!
//! The map is always rebuilt wholesale: every constructor validates that the
//! input is a bijection, and callers replace the old map instead of merging
//! into it, so entries from a previous connection cannot survive.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::message::{ErrorCode, ProxyId};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdMapError {
    #[error("id pair sequence has odd length {0}")]
    OddLength(usize),
    #[error("id {0} does not fit a proxy id")]
    OutOfRange(u64),
    #[error("simulation id {0} mapped twice")]
    DuplicateSim(ProxyId),
    #[error("local id {0} mapped twice")]
    DuplicateLocal(ProxyId),
}

impl ErrorCode for IdMapError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::OddLength(_) => "E_IDMAP_ODD_LENGTH",
            Self::OutOfRange(_) => "E_IDMAP_OUT_OF_RANGE",
            Self::DuplicateSim(_) | Self::DuplicateLocal(_) => "E_IDMAP_NOT_BIJECTIVE",
        }
    }
}

/// Which side of each pair is listed first on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdPairOrder {
    /// `[sim, local, sim, local, ...]`
    SimFirst,
    /// `[local, sim, local, sim, ...]`, as simulations send it.
    #[default]
    LocalFirst,
}

impl FromStr for IdPairOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim-first" | "sim_first" => Ok(Self::SimFirst),
            "local-first" | "local_first" => Ok(Self::LocalFirst),
            other => Err(format!("unknown id pair order: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    sim_to_local: BTreeMap<ProxyId, ProxyId>,
    local_to_sim: BTreeMap<ProxyId, ProxyId>,
}

impl IdMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(sim, local)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSim` / `DuplicateLocal` if either side repeats.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ProxyId, ProxyId)>) -> Result<Self, IdMapError> {
        let mut map = Self::new();
        for (sim, local) in pairs {
            if map.sim_to_local.contains_key(&sim) {
                return Err(IdMapError::DuplicateSim(sim));
            }
            if map.local_to_sim.contains_key(&local) {
                return Err(IdMapError::DuplicateLocal(local));
            }
            map.sim_to_local.insert(sim, local);
            map.local_to_sim.insert(local, sim);
        }
        Ok(map)
    }

    /// Build from a flat alternating sequence as received on the wire.
    ///
    /// # Errors
    ///
    /// Returns `OddLength` for an unpaired trailing id, `OutOfRange` for ids
    /// wider than a proxy id, and the bijection errors of [`IdMap::from_pairs`].
    pub fn from_alternating(seq: &[u64], order: IdPairOrder) -> Result<Self, IdMapError> {
        if seq.len() % 2 != 0 {
            return Err(IdMapError::OddLength(seq.len()));
        }
        let mut pairs = Vec::with_capacity(seq.len() / 2);
        for chunk in seq.chunks_exact(2) {
            let first = narrow(chunk[0])?;
            let second = narrow(chunk[1])?;
            pairs.push(match order {
                IdPairOrder::SimFirst => (first, second),
                IdPairOrder::LocalFirst => (second, first),
            });
        }
        Self::from_pairs(pairs)
    }

    #[must_use]
    pub fn local_for(&self, sim: ProxyId) -> Option<ProxyId> {
        self.sim_to_local.get(&sim).copied()
    }

    #[must_use]
    pub fn sim_for(&self, local: ProxyId) -> Option<ProxyId> {
        self.local_to_sim.get(&local).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sim_to_local.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sim_to_local.is_empty()
    }

    /// `(sim, local)` pairs ordered by simulation id.
    pub fn iter(&self) -> impl Iterator<Item = (ProxyId, ProxyId)> + '_ {
        self.sim_to_local.iter().map(|(s, l)| (*s, *l))
    }
}

fn narrow(id: u64) -> Result<ProxyId, IdMapError> {
    ProxyId::try_from(id).map_err(|_| IdMapError::OutOfRange(id))
}
