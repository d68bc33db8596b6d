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

//! Per-pool waiting rooms for fresh (mustMix) and remixing (liquidity) inputs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bitcoin::OutPoint;

use crate::input::RegisteredInput;

/// FIFO of inputs waiting for a mix.
#[derive(Debug, Default)]
pub struct InputQueue {
    entries: VecDeque<RegisteredInput>,
}

impl InputQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<&RegisteredInput> {
        self.entries.iter().find(|i| i.outpoint() == outpoint)
    }

    fn find_mut(&mut self, outpoint: &OutPoint) -> Option<&mut RegisteredInput> {
        self.entries.iter_mut().find(|i| i.outpoint() == outpoint)
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<RegisteredInput> {
        let position = self.entries.iter().position(|i| i.outpoint() == outpoint)?;
        self.entries.remove(position)
    }

    fn remove_where<F: Fn(&RegisteredInput) -> bool>(&mut self, pred: F) -> Vec<RegisteredInput> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for input in self.entries.drain(..) {
            if pred(&input) {
                removed.push(input);
            } else {
                kept.push_back(input);
            }
        }
        self.entries = kept;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredInput> {
        self.entries.iter()
    }
}

/// Outcome of a successful queue registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Queued,
    /// Same participant registered the same UTXO again.
    Refreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The UTXO is waiting under another identity.
    AlreadyQueued,
    Full { depth: usize },
}

/// Admission counts of a mix, used to decide which queue feeds it next.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub anonymity_set: usize,
    pub min_must_mix: usize,
}

impl AdmissionPolicy {
    /// Liquidity never takes the seats reserved for mustMix inputs.
    pub fn max_liquidity(&self) -> usize {
        self.anonymity_set.saturating_sub(self.min_must_mix)
    }
}

/// Both queues of a pool.
#[derive(Debug)]
pub struct PoolQueues {
    must_mix: InputQueue,
    liquidity: InputQueue,
    max_depth: usize,
}

impl PoolQueues {
    pub fn new(max_depth: usize) -> Self {
        Self {
            must_mix: InputQueue::default(),
            liquidity: InputQueue::default(),
            max_depth,
        }
    }

    pub fn must_mix(&self) -> &InputQueue {
        &self.must_mix
    }

    pub fn liquidity(&self) -> &InputQueue {
        &self.liquidity
    }

    pub fn len(&self) -> usize {
        self.must_mix.len() + self.liquidity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<&RegisteredInput> {
        self.must_mix
            .find(outpoint)
            .or_else(|| self.liquidity.find(outpoint))
    }

    /// Queues `input` at the back of its queue. A second registration of a waiting UTXO by
    /// the same participant only refreshes its liveness.
    pub fn register(
        &mut self,
        input: RegisteredInput,
        now: Instant,
    ) -> Result<Registration, QueueError> {
        let outpoint = *input.outpoint();

        let existing = match self.must_mix.find_mut(&outpoint) {
            Some(existing) => Some(existing),
            None => self.liquidity.find_mut(&outpoint),
        };
        if let Some(existing) = existing {
            return if existing.same_identity(&input) {
                existing.refresh(now);
                Ok(Registration::Refreshed)
            } else {
                Err(QueueError::AlreadyQueued)
            };
        }

        let max_depth = self.max_depth;
        let queue = self.queue_mut(input.liquidity);
        if queue.len() >= max_depth {
            return Err(QueueError::Full { depth: queue.len() });
        }

        queue.entries.push_back(input);
        Ok(Registration::Queued)
    }

    /// Puts an input evicted from a mix back at the front of its queue. Depth limits do not
    /// apply, returned inputs are never dropped.
    pub fn requeue(&mut self, mut input: RegisteredInput) {
        input.quarantine = None;
        self.queue_mut(input.liquidity).entries.push_front(input);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<RegisteredInput> {
        self.must_mix
            .remove(outpoint)
            .or_else(|| self.liquidity.remove(outpoint))
    }

    /// Removes directory registrations that were not refreshed within `timeout`.
    pub fn sweep_stale(&mut self, now: Instant, timeout: Duration) -> Vec<RegisteredInput> {
        let mut swept = self.must_mix.remove_where(|i| i.is_stale(now, timeout));
        swept.extend(self.liquidity.remove_where(|i| i.is_stale(now, timeout)));
        swept
    }

    /// Removes the direct (non-directory) inputs of a disconnected participant.
    pub fn disconnect(&mut self, username: &str) -> Vec<RegisteredInput> {
        let pred = |i: &RegisteredInput| !i.is_soroban_origin() && i.username == username;
        let mut removed = self.must_mix.remove_where(pred);
        removed.extend(self.liquidity.remove_where(pred));
        removed
    }

    /// Picks the next input for a mix currently holding `must_mix` fresh and `liquidity`
    /// remixing inputs: mustMix first until `min_must_mix` is reached, then both queues in
    /// turn.
    pub fn next_for_mix(
        &mut self,
        must_mix: usize,
        liquidity: usize,
        policy: &AdmissionPolicy,
    ) -> Option<RegisteredInput> {
        if must_mix + liquidity >= policy.anonymity_set {
            return None;
        }

        let liquidity_open = liquidity < policy.max_liquidity() && !self.liquidity.is_empty();

        if must_mix < policy.min_must_mix && !self.must_mix.is_empty() {
            return self.must_mix.entries.pop_front();
        }

        let prefer_liquidity =
            liquidity_open && liquidity <= must_mix.saturating_sub(policy.min_must_mix);

        if prefer_liquidity || self.must_mix.is_empty() {
            if liquidity_open {
                return self.liquidity.entries.pop_front();
            }
            return None;
        }

        self.must_mix.entries.pop_front()
    }

    fn queue_mut(&mut self, liquidity: bool) -> &mut InputQueue {
        if liquidity {
            &mut self.liquidity
        } else {
            &mut self.must_mix
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil;

    const POLICY: AdmissionPolicy = AdmissionPolicy {
        anonymity_set: 5,
        min_must_mix: 3,
    };

    #[test]
    fn reregistration_refreshes() {
        let start = Instant::now();
        let mut queues = PoolQueues::new(10);
        let input = testutil::soroban_input(1, false, "pm-alice", start);

        assert_eq!(queues.register(input.clone(), start), Ok(Registration::Queued));

        let later = start + Duration::from_secs(30);
        assert_eq!(queues.register(input.clone(), later), Ok(Registration::Refreshed));
        assert_eq!(queues.len(), 1);
        assert_eq!(
            queues.find(input.outpoint()).unwrap().soroban.as_ref().unwrap().last_seen,
            later
        );

        let mut stolen = input;
        stolen.soroban.as_mut().unwrap().sender = "pm-mallory".to_owned();
        assert_eq!(queues.register(stolen, later), Err(QueueError::AlreadyQueued));
        assert_eq!(queues.len(), 1);
    }

    #[test]
    fn depth_bound() {
        let now = Instant::now();
        let mut queues = PoolQueues::new(2);
        queues.register(testutil::input(1, false, "a"), now).unwrap();
        queues.register(testutil::input(2, false, "b"), now).unwrap();

        assert_eq!(
            queues.register(testutil::input(3, false, "c"), now),
            Err(QueueError::Full { depth: 2 })
        );
        // the other queue has its own bound
        queues.register(testutil::input(4, true, "d"), now).unwrap();

        // returned inputs ignore the bound
        queues.requeue(testutil::input(5, false, "e"));
        assert_eq!(queues.must_mix().len(), 3);
        assert_eq!(queues.must_mix().iter().next().unwrap().username, "e");
    }

    #[test]
    fn fifo_and_requeue_at_front() {
        let now = Instant::now();
        let mut queues = PoolQueues::new(10);
        for (n, name) in ["a", "b", "c"].iter().enumerate() {
            queues.register(testutil::input(n as u8 + 1, false, name), now).unwrap();
        }

        let first = queues.next_for_mix(0, 0, &POLICY).unwrap();
        assert_eq!(first.username, "a");
        queues.requeue(first);

        let order: Vec<_> = queues.must_mix().iter().map(|i| i.username.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn liquidity_cap_and_alternation() {
        let now = Instant::now();
        let mut queues = PoolQueues::new(10);
        for n in 1..=4 {
            queues.register(testutil::input(n, true, "remixer"), now).unwrap();
        }

        // liquidity may take up to anonymity_set - min_must_mix seats on its own
        let (mut must_mix, mut liquidity) = (0, 0);
        while let Some(input) = queues.next_for_mix(must_mix, liquidity, &POLICY) {
            assert!(input.liquidity);
            liquidity += 1;
        }
        assert_eq!(liquidity, 2);
        assert_eq!(queues.liquidity().len(), 2);

        for n in 10..=13 {
            queues.register(testutil::input(n, false, "fresh"), now).unwrap();
        }
        let mut picks = Vec::new();
        while let Some(input) = queues.next_for_mix(must_mix, liquidity, &POLICY) {
            if input.liquidity {
                liquidity += 1;
            } else {
                must_mix += 1;
            }
            picks.push(input.liquidity);
        }
        assert_eq!(picks, vec![false, false, false]);
        assert_eq!((must_mix, liquidity), (3, 2));
    }

    #[test]
    fn alternation_beyond_minimum() {
        let now = Instant::now();
        let policy = AdmissionPolicy {
            anonymity_set: 8,
            min_must_mix: 2,
        };
        let mut queues = PoolQueues::new(10);
        for n in 1..=5 {
            queues.register(testutil::input(n, false, "fresh"), now).unwrap();
            queues.register(testutil::input(n + 20, true, "remixer"), now).unwrap();
        }

        let (mut must_mix, mut liquidity) = (0, 0);
        let mut picks = Vec::new();
        while let Some(input) = queues.next_for_mix(must_mix, liquidity, &policy) {
            if input.liquidity {
                liquidity += 1;
            } else {
                must_mix += 1;
            }
            picks.push(if input.liquidity { 'L' } else { 'M' });
        }

        assert_eq!(picks.iter().collect::<String>(), "MMLMLMLM");
        assert_eq!(must_mix + liquidity, 8);
    }

    #[test]
    fn sweep_and_disconnect() {
        let start = Instant::now();
        let mut queues = PoolQueues::new(10);
        queues
            .register(testutil::soroban_input(1, false, "pm-alice", start), start)
            .unwrap();
        queues.register(testutil::input(2, true, "bob"), start).unwrap();
        queues.register(testutil::input(3, false, "bob"), start).unwrap();

        let later = start + Duration::from_secs(120);
        let swept = queues.sweep_stale(later, Duration::from_secs(60));
        assert_eq!(swept.len(), 1);
        assert_eq!(queues.len(), 2);

        assert_eq!(queues.disconnect("bob").len(), 2);
        assert!(queues.is_empty());
    }
}
