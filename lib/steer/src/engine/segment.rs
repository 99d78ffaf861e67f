// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet segments.
//!
//! A segment describes one layer of a multi-layer flow: which protocol
//! headers are present and which fields of those headers participate
//! in the match. A flow description is at most two segments deep
//! (outer and inner).

use super::extract::FieldExtract;
use super::field::FIELD_COUNT;
use super::field::FlowField;
use crate::api::ErrorKind;
use crate::api::FlowError;
use bitflags::bitflags;

/// Maximum number of segments in one flow description.
pub const SEG_MAX: usize = 2;

/// Maximum number of raw (non-symbolic) fields per segment.
pub const SEG_RAW_FLD_MAX: usize = 2;

/// "No location" marker for a field's buffer-offset triplet.
pub const FLD_OFF_INVALID: u16 = 0xffff;

bitflags! {
    /// Protocol headers present in one packet segment.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SegHdrs: u32 {
        const ETH = 1 << 0;
        const VLAN = 1 << 1;
        const IPV4 = 1 << 2;
        const IPV6 = 1 << 3;
        const ARP = 1 << 4;
        const ICMP = 1 << 5;
        const TCP = 1 << 6;
        const UDP = 1 << 7;
        const SCTP = 1 << 8;
        const GRE = 1 << 9;
        const GTPC = 1 << 10;
        const GTPC_TEID = 1 << 11;
        const GTPU_IP = 1 << 12;
        const GTPU_EH = 1 << 13;
        const GTPU_DWN = 1 << 14;
        const GTPU_UP = 1 << 15;
        const PPPOE = 1 << 16;
    }
}

impl SegHdrs {
    pub const GTPU: SegHdrs = SegHdrs::GTPU_IP
        .union(SegHdrs::GTPU_EH)
        .union(SegHdrs::GTPU_DWN)
        .union(SegHdrs::GTPU_UP);

    pub const L2_MASK: SegHdrs = SegHdrs::ETH.union(SegHdrs::VLAN);

    pub const L3_MASK: SegHdrs =
        SegHdrs::IPV4.union(SegHdrs::IPV6).union(SegHdrs::ARP);

    pub const L4_MASK: SegHdrs = SegHdrs::ICMP
        .union(SegHdrs::TCP)
        .union(SegHdrs::UDP)
        .union(SegHdrs::SCTP);
}

/// How a field participates in the match.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MatchKind {
    /// Exact value under mask.
    #[default]
    Regular,
    /// Value within [value, last].
    Range,
    /// Value under a prefix; the mask slot holds the prefix location
    /// and the last slot its size.
    Prefix,
    /// Raw field; the last slot holds the byte length.
    Size,
}

/// Byte offsets into a caller-supplied match-data buffer from which a
/// field's value, mask, and upper bound are taken when an entry is
/// instantiated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SrcLoc {
    pub val: u16,
    pub mask: u16,
    pub last: u16,
}

impl Default for SrcLoc {
    fn default() -> Self {
        Self {
            val: FLD_OFF_INVALID,
            mask: FLD_OFF_INVALID,
            last: FLD_OFF_INVALID,
        }
    }
}

/// Where one matched field comes from and, once the profile has been
/// compiled, where the hardware extracts it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FieldLocation {
    pub kind: MatchKind,
    pub src: SrcLoc,
    pub xtrct: FieldExtract,
}

/// A raw byte-range match in the payload region of a segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawField {
    /// Offset of the raw bytes from the start of the segment.
    pub off: u16,
    pub info: FieldLocation,
}

/// One layer of a flow description.
#[derive(Clone, Debug)]
pub struct Segment {
    pub hdrs: SegHdrs,
    /// Bit per [`FlowField`] participating in the match.
    pub match_mask: u64,
    /// Bits of `match_mask` matched as ranges.
    pub range_mask: u64,
    pub fields: [FieldLocation; FIELD_COUNT],
    pub raws: Vec<RawField>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            hdrs: SegHdrs::empty(),
            match_mask: 0,
            range_mask: 0,
            fields: [FieldLocation::default(); FIELD_COUNT],
            raws: Vec::new(),
        }
    }
}

impl Segment {
    pub fn new(hdrs: SegHdrs) -> Self {
        Self { hdrs, ..Default::default() }
    }

    fn set_field_ext(
        &mut self,
        fld: FlowField,
        kind: MatchKind,
        val_loc: u16,
        mask_loc: u16,
        last_loc: u16,
    ) {
        let bit = fld.bit();

        self.match_mask |= bit;
        if kind == MatchKind::Range {
            self.range_mask |= bit;
        }

        let loc = &mut self.fields[fld.index() as usize];
        loc.kind = kind;
        loc.src = SrcLoc { val: val_loc, mask: mask_loc, last: last_loc };

        // A field opportunistically implies its protocol header;
        // headers with no implying field must be set explicitly.
        self.hdrs |= fld.info().hdr;
    }

    /// Mark `fld` as matched, with the locations of its value, mask,
    /// and (for ranges) upper bound in the entry input buffer.
    pub fn set_field(
        &mut self,
        fld: FlowField,
        val_loc: u16,
        mask_loc: u16,
        last_loc: u16,
        range: bool,
    ) {
        let kind =
            if range { MatchKind::Range } else { MatchKind::Regular };
        self.set_field_ext(fld, kind, val_loc, mask_loc, last_loc);
    }

    /// Mark `fld` as prefix-matched. The prefix value's location and
    /// the size of that location ride in the mask/last slots.
    pub fn set_field_prefix(
        &mut self,
        fld: FlowField,
        val_loc: u16,
        pref_loc: u16,
        pref_sz: u8,
    ) {
        self.set_field_ext(
            fld,
            MatchKind::Prefix,
            val_loc,
            pref_loc,
            u16::from(pref_sz),
        );
    }

    /// Add a raw byte-range match at `off` bytes into the segment.
    ///
    /// Overflow of the raw-field array is reported when the profile is
    /// compiled, not here.
    pub fn add_raw_field(
        &mut self,
        off: u16,
        len: u8,
        val_loc: u16,
        mask_loc: u16,
    ) {
        self.raws.push(RawField {
            off,
            info: FieldLocation {
                kind: MatchKind::Size,
                src: SrcLoc {
                    val: val_loc,
                    mask: mask_loc,
                    // The length of the field rides in the last slot.
                    last: u16::from(len),
                },
                xtrct: FieldExtract::default(),
            },
        });
    }
}

/// Reject segments carrying more than one header within the L3 group
/// or more than one within the L4 group.
pub fn validate_headers(segs: &[Segment]) -> Result<(), FlowError> {
    for seg in segs {
        let l3 = (seg.hdrs & SegHdrs::L3_MASK).bits();
        if l3 != 0 && !super::bitmap::is_pow2(u64::from(l3)) {
            return Err(FlowError::new(
                ErrorKind::Conflict,
                "multiple L3 headers in one segment",
            ));
        }

        let l4 = (seg.hdrs & SegHdrs::L4_MASK).bits();
        if l4 != 0 && !super::bitmap::is_pow2(u64::from(l4)) {
            return Err(FlowError::new(
                ErrorKind::Conflict,
                "multiple L4 headers in one segment",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_field_implies_header() {
        let mut seg = Segment::default();
        seg.set_field(
            FlowField::Ipv4Src,
            0,
            FLD_OFF_INVALID,
            FLD_OFF_INVALID,
            false,
        );
        assert!(seg.hdrs.contains(SegHdrs::IPV4));
        assert_eq!(seg.match_mask, FlowField::Ipv4Src.bit());
        assert_eq!(seg.range_mask, 0);

        // TTL implies nothing on its own.
        seg.set_field(
            FlowField::Ipv4Ttl,
            4,
            FLD_OFF_INVALID,
            FLD_OFF_INVALID,
            true,
        );
        assert_eq!(seg.hdrs, SegHdrs::IPV4);
        assert_eq!(seg.range_mask, FlowField::Ipv4Ttl.bit());
    }

    #[test]
    fn multiple_l3_rejected() {
        let seg = Segment::new(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::IPV6);
        let err = validate_headers(&[seg]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[test]
    fn multiple_l4_rejected() {
        let seg = Segment::new(SegHdrs::IPV4 | SegHdrs::TCP | SegHdrs::UDP);
        assert!(validate_headers(&[seg]).is_err());
    }

    #[test]
    fn single_headers_per_group_ok() {
        let seg =
            Segment::new(SegHdrs::ETH | SegHdrs::VLAN | SegHdrs::IPV6 | SegHdrs::TCP);
        assert!(validate_headers(&[seg]).is_ok());
    }
}
