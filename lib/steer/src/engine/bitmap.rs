// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Fixed-width bitmaps.
//!
//! The membership bitmaps (VSIs per profile, VSIs per RSS record) and
//! the packet-type candidate sets are fixed-width bit arrays; this is
//! the small set of operations the engine needs over them.

use steer_api::MAX_VSI;

const VSI_WORDS: usize = (MAX_VSI as usize).div_ceil(64);

/// Membership bitmap over software VSI handles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VsiBitmap {
    words: [u64; VSI_WORDS],
}

impl Default for VsiBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl VsiBitmap {
    pub const fn new() -> Self {
        Self { words: [0; VSI_WORDS] }
    }

    pub fn set(&mut self, vsi: u16) {
        debug_assert!(vsi < MAX_VSI);
        self.words[usize::from(vsi) / 64] |= 1u64 << (vsi % 64);
    }

    pub fn clear(&mut self, vsi: u16) {
        debug_assert!(vsi < MAX_VSI);
        self.words[usize::from(vsi) / 64] &= !(1u64 << (vsi % 64));
    }

    pub fn is_set(&self, vsi: u16) -> bool {
        debug_assert!(vsi < MAX_VSI);
        self.words[usize::from(vsi) / 64] & (1u64 << (vsi % 64)) != 0
    }

    /// Is any VSI a member?
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    /// Iterate over the member VSI handles in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..MAX_VSI).filter(move |v| self.is_set(*v))
    }
}

/// Number of hardware packet-type classes tracked per block.
pub const PTYPE_MAX: usize = 1024;

const PTYPE_WORDS: usize = PTYPE_MAX / 32;

/// A candidate set of hardware packet-type classes. Seeded full and
/// narrowed by intersection as protocol headers are added.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PtypeBitmap {
    words: [u32; PTYPE_WORDS],
}

impl PtypeBitmap {
    /// Every packet type possible.
    pub const fn all() -> Self {
        Self { words: [u32::MAX; PTYPE_WORDS] }
    }

    pub const fn none() -> Self {
        Self { words: [0; PTYPE_WORDS] }
    }

    /// Narrow the candidate set by a per-header static table.
    pub fn intersect(&mut self, table: &[u32; PTYPE_WORDS]) {
        for (w, t) in self.words.iter_mut().zip(table.iter()) {
            *w &= *t;
        }
    }

    pub fn is_set(&self, ptype: u16) -> bool {
        debug_assert!((ptype as usize) < PTYPE_MAX);
        self.words[usize::from(ptype) / 32] & (1u32 << (ptype % 32)) != 0
    }

    pub fn words(&self) -> &[u32; PTYPE_WORDS] {
        &self.words
    }
}

impl core::fmt::Debug for PtypeBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let n: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        write!(f, "PtypeBitmap({} set)", n)
    }
}

/// Is `val` a power of two (exactly one bit set)?
pub fn is_pow2(val: u64) -> bool {
    val != 0 && val & (val - 1) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vsi_set_clear() {
        let mut bm = VsiBitmap::new();
        assert!(!bm.any());
        bm.set(3);
        bm.set(700);
        assert!(bm.is_set(3));
        assert!(bm.is_set(700));
        assert!(!bm.is_set(4));
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![3, 700]);
        bm.clear(3);
        bm.clear(700);
        assert!(!bm.any());
    }

    #[test]
    fn ptype_intersect() {
        let mut bm = PtypeBitmap::all();
        let mut table = [0u32; PTYPE_MAX / 32];
        table[0] = 0b1010;
        bm.intersect(&table);
        assert!(bm.is_set(1));
        assert!(bm.is_set(3));
        assert!(!bm.is_set(0));
        assert!(!bm.is_set(64));
    }

    #[test]
    fn pow2() {
        assert!(is_pow2(1));
        assert!(is_pow2(0x8000_0000_0000_0000));
        assert!(!is_pow2(0));
        assert!(!is_pow2(6));
    }
}
