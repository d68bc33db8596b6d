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

const P2WPKH_IN_SIZE: f64 = 67.75;
const P2WPKH_OUT_SIZE: f64 = 31.0;

// segwit_marker + segwit_flag
const WITNESS_MARKER: f64 = 0.50;

/// Estimates the size in vBytes of a mix transaction with `n_inputs` P2WPKH inputs and as many
/// P2WPKH outputs.
pub fn estimate_mix_tx_size(n_inputs: usize) -> f64 {
    let inputs = n_inputs as f64 * P2WPKH_IN_SIZE;
    let outputs = n_inputs as f64 * P2WPKH_OUT_SIZE;
    let overhead = 4_f64 // nVersion
        + sizeof_varint(n_inputs) as f64
        + sizeof_varint(n_inputs) as f64
        + 4_f64 // nLockTime
        + WITNESS_MARKER;

    inputs + outputs + overhead
}

/// Minimum miner fee in sats for relaying a mix of `n_inputs`.
pub fn mix_relay_fee(n_inputs: usize, sats_per_vbyte: u64) -> u64 {
    (estimate_mix_tx_size(n_inputs) * sats_per_vbyte as f64).ceil() as u64
}

/// Share of the relay fee of a mix of `n_inputs` that each of `payers` mustMix inputs has to
/// carry on top of the denomination.
pub fn must_mix_fee_share(n_inputs: usize, payers: usize, sats_per_vbyte: u64) -> u64 {
    let payers = payers.max(1) as u64;
    (mix_relay_fee(n_inputs, sats_per_vbyte) + payers - 1) / payers
}

fn sizeof_varint(int: usize) -> usize {
    match int {
        0..=252 => 1,
        253..=65534 => 3,
        65535..=4294967294 => 5,
        _ => 9,
    }
}
