// whirlpool-coordinator-rs
// Copyright (C) 2022  Straylight <straylight_orbit@protonmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::pool::{MixStatus, Pool, PoolId};
use crate::Error;

/// A pool behind its own lock. Nothing else guards a pool's queues and mix.
#[derive(Debug)]
pub struct PoolHandle {
    id: PoolId,
    denomination: u64,
    pool: Mutex<Pool>,
}

impl PoolHandle {
    fn new(pool: Pool) -> Self {
        Self {
            id: pool.id().clone(),
            denomination: pool.denomination(),
            pool: Mutex::new(pool),
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.id
    }

    pub fn denomination(&self) -> u64 {
        self.denomination
    }

    pub fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.pool.is_locked()
    }
}

/// Information about a pool as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub pool_id: PoolId,
    pub denomination: u64,
    pub fee_value: u64,
    pub must_mix_balance_min: u64,
    pub must_mix_balance_cap: u64,
    pub must_mix_balance_max: u64,
    pub min_anonymity_set: usize,
    pub min_must_mix: usize,
    pub tx0_max_outputs: u16,
    pub nb_registered: usize,
    pub mix_anonymity_set: usize,
    pub mix_status: MixStatus,
    /// Seconds since the current mix started.
    pub elapsed_time: u64,
    pub nb_confirmed: usize,
}

/// The configured pools, smallest denomination first.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: Vec<Arc<PoolHandle>>,
}

impl PoolRegistry {
    pub fn new(pools: Vec<Pool>) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for pool in &pools {
            if !seen.insert(pool.id().clone()) {
                return Err(Error::Usage(format!("Duplicate pool: {}", pool.id())));
            }
        }

        let mut pools: Vec<_> = pools
            .into_iter()
            .map(|pool| Arc::new(PoolHandle::new(pool)))
            .collect();
        pools.sort_by_key(|handle| handle.denomination());

        Ok(Self { pools })
    }

    pub fn pools(&self) -> &[Arc<PoolHandle>] {
        &self.pools
    }

    pub fn pool(&self, id: &PoolId) -> Result<&Arc<PoolHandle>, Error> {
        self.pools
            .iter()
            .find(|handle| handle.id() == id)
            .ok_or_else(|| Error::PoolNotFound(id.clone()))
    }

    pub fn nb_registered(&self, id: &PoolId) -> Result<usize, Error> {
        Ok(self.pool(id)?.lock().nb_registered())
    }

    pub fn nb_confirmed(&self, id: &PoolId) -> Result<usize, Error> {
        Ok(self.pool(id)?.lock().nb_confirmed())
    }

    pub fn mix_status(&self, id: &PoolId) -> Result<MixStatus, Error> {
        Ok(self.pool(id)?.lock().mix().status())
    }

    /// One summary per pool. Every pool is locked on its own, so the figures of different
    /// pools may come from slightly different moments.
    pub fn summaries(&self, now: Instant) -> Vec<PoolSummary> {
        self.pools
            .iter()
            .map(|handle| summary(&handle.lock(), now))
            .collect()
    }
}

fn summary(pool: &Pool, now: Instant) -> PoolSummary {
    let config = pool.config();
    let bounds = pool.bounds();
    PoolSummary {
        pool_id: config.pool_id.clone(),
        denomination: config.denomination,
        fee_value: pool.fees().current().1,
        must_mix_balance_min: bounds.min,
        must_mix_balance_cap: bounds.cap,
        must_mix_balance_max: bounds.max,
        min_anonymity_set: config.min_anonymity_set,
        min_must_mix: config.min_must_mix,
        tx0_max_outputs: config.tx0_max_outputs,
        nb_registered: pool.nb_registered(),
        mix_anonymity_set: config.anonymity_set,
        mix_status: pool.mix().status(),
        elapsed_time: pool.mix().elapsed(now).as_secs(),
        nb_confirmed: pool.nb_confirmed(),
    }
}
