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

//! BIP69 lexicographical ordering of transaction inputs and outputs.

use std::cmp::Ordering;

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, TxOut};

/// Orders outpoints by previous txid in its displayed (reversed) byte order, then by index.
#[derive(Debug, PartialEq, Eq)]
pub struct ComparableOutpoint<'a>(pub &'a OutPoint);

impl Ord for ComparableOutpoint<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        let ours = self.0.txid.as_hash().into_inner();
        let theirs = other.0.txid.as_hash().into_inner();

        ours.iter()
            .rev()
            .cmp(theirs.iter().rev())
            .then(self.0.vout.cmp(&other.0.vout))
    }
}

impl PartialOrd for ComparableOutpoint<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders outputs by value, then by script bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct ComparableTxOut<'a>(pub &'a TxOut);

impl Ord for ComparableTxOut<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .value
            .cmp(&other.0.value)
            .then_with(|| {
                self.0
                    .script_pubkey
                    .as_bytes()
                    .cmp(other.0.script_pubkey.as_bytes())
            })
    }
}

impl PartialOrd for ComparableTxOut<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::{OutPoint, Script, TxOut};

    use super::*;

    #[test]
    fn outpoints() {
        let mut outpoints = vec![
            OutPoint::from_str("5e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:1")
                .unwrap(),
            OutPoint::from_str("4e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:5")
                .unwrap(),
            OutPoint::from_str("4e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:2")
                .unwrap(),
            OutPoint::from_str("1e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:0")
                .unwrap(),
        ];

        outpoints.sort_by(|a, b| ComparableOutpoint(a).cmp(&ComparableOutpoint(b)));

        let sorted: Vec<_> = outpoints.iter().map(|o| o.to_string()).collect();
        assert_eq!(
            sorted,
            vec![
                "1e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:0",
                "4e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:2",
                "4e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:5",
                "5e2383defe7efcbdc9fdd6dba55da148b206617bbb49e6bb93fce7bfbb459d44:1",
            ]
        );
    }

    #[test]
    fn outputs() {
        let a = TxOut {
            value: 1_000_000,
            script_pubkey: Script::from(vec![0x00, 0x14, 0x02]),
        };
        let b = TxOut {
            value: 1_000_000,
            script_pubkey: Script::from(vec![0x00, 0x14, 0x01]),
        };
        let c = TxOut {
            value: 50_000,
            script_pubkey: Script::from(vec![0x6a]),
        };

        let mut outputs = vec![a.clone(), b.clone(), c.clone()];
        outputs.sort_by(|x, y| ComparableTxOut(x).cmp(&ComparableTxOut(y)));

        assert_eq!(outputs, vec![c, b, a]);
    }
}
