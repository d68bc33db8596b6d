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

pub mod bip47;
pub mod bip69;
pub mod fee;
pub mod signature;
pub mod z85;

pub mod hashes {
    use bitcoin::hashes::hex::ToHex;
    use bitcoin::hashes::{sha512, Hash};
    use bitcoin::OutPoint;

    /// Computes the inputs hash of a mix: sha512 over the sorted `{txid}{vout}` strings joined
    /// by `;`, hex encoded.
    pub fn inputs_hash<'a, I>(outpoints: I) -> String
    where
        I: IntoIterator<Item = &'a OutPoint>,
    {
        let mut values: Vec<_> = outpoints
            .into_iter()
            .map(|out| format!("{}{}", out.txid, out.vout))
            .collect();
        values.sort();

        sha512::Hash::hash(values.join(";").as_bytes()).to_hex()
    }

}
