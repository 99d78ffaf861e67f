// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet-type filter.
//!
//! Each protocol header, by position (outer/first vs. inner/last),
//! pins down which hardware packet-type classes a flow can still
//! belong to. Candidate sets start full and are narrowed by
//! intersection per header; this step never fails.

use super::bitmap::PTYPE_MAX;
use super::bitmap::PtypeBitmap;
use super::segment::SegHdrs;
use super::segment::Segment;

const WORDS: usize = PTYPE_MAX / 32;

const fn tbl<const N: usize>(head: [u32; N]) -> [u32; WORDS] {
    let mut out = [0u32; WORDS];
    let mut i = 0;
    while i < N {
        out[i] = head[i];
        i += 1;
    }
    out
}

/// Packet types for packets with an Outer/First/Single MAC header.
static PTYPES_MAC_OFOS: [u32; WORDS] = tbl([
    0xFDC00846, 0xBFBF7F7E, 0xF70001DF, 0xFEFDFDFB, 0x0000077E, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00003000,
]);

/// Packet types for packets with an Innermost/Last MAC header.
static PTYPES_MAC_IL: [u32; WORDS] = tbl([0x00000000]);

/// Packet types for packets with an Innermost/Last MAC VLAN header.
static PTYPES_MACVLAN_IL: [u32; WORDS] = tbl([
    0x00000000, 0xBC000000, 0x000001DF, 0xF0000000, 0x0000077E,
]);

/// Packet types for packets with an Outer/First/Single IPv4 header.
static PTYPES_IPV4_OFOS: [u32; WORDS] = tbl([
    0x1DC00000, 0x04000800, 0x00000000, 0x00000000, 0x00000000, 0x00000000,
    0x00000000, 0x00000000, 0x0003000F, 0x000FC000, 0x03E0F800,
]);

/// Packet types for packets with an Innermost/Last IPv4 header.
static PTYPES_IPV4_IL: [u32; WORDS] = tbl([
    0xE0000000, 0xB807700E, 0x80000003, 0xE01DC03B, 0x0000000E, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x001FF800,
]);

/// Packet types for packets with an Outer/First/Single IPv6 header.
static PTYPES_IPV6_OFOS: [u32; WORDS] = tbl([
    0x00000000, 0x00000000, 0x77000000, 0x10002000, 0x00000000, 0x00000000,
    0x00000000, 0x00000000, 0x00080F00, 0x03F00000, 0x7C1F0000,
]);

/// Packet types for packets with an Innermost/Last IPv6 header.
static PTYPES_IPV6_IL: [u32; WORDS] = tbl([
    0x00000000, 0x03B80770, 0x000001DC, 0x0EE00000, 0x00000770, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x7FE00000,
]);

/// Packet types for packets with an Outermost/First ARP header.
static PTYPES_ARP_OF: [u32; WORDS] = tbl([0x00000800]);

/// UDP packet types for non-tunneled packets or tunneled packets with
/// inner UDP.
static PTYPES_UDP_IL: [u32; WORDS] = tbl([
    0x81000000, 0x20204040, 0x04000010, 0x80810102, 0x00000040, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00410000, 0x10842000,
]);

/// Packet types for packets with an Innermost/Last TCP header.
static PTYPES_TCP_IL: [u32; WORDS] = tbl([
    0x04000000, 0x80810102, 0x10000040, 0x02040408, 0x00000102, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00820000, 0x21084000,
]);

/// Packet types for packets with an Innermost/Last SCTP header.
static PTYPES_SCTP_IL: [u32; WORDS] = tbl([
    0x08000000, 0x01020204, 0x20000081, 0x04080810, 0x00000204, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x01040000,
]);

/// Packet types for packets with an Outermost/First ICMP header.
static PTYPES_ICMP_OF: [u32; WORDS] = tbl([0x10000000]);

/// Packet types for packets with an Innermost/Last ICMP header.
static PTYPES_ICMP_IL: [u32; WORDS] = tbl([
    0x00000000, 0x02040408, 0x40000102, 0x08101020, 0x00000408, 0x00000000,
    0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x42108000,
]);

/// Packet types for packets with an Outermost/First GRE header.
static PTYPES_GRE_OF: [u32; WORDS] = tbl([
    0x00000000, 0xBFBF7800, 0x000001DF, 0xFEFDE000, 0x0000017E,
]);

/// Packet types for GTPC.
static PTYPES_GTPC: [u32; WORDS] =
    tbl([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00000180]);

/// Packet types for GTPC with TEID.
static PTYPES_GTPC_TID: [u32; WORDS] =
    tbl([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00000060]);

/// Packet types for GTPU.
static PTYPES_GTPU: [u32; WORDS] =
    tbl([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x7FFFFE00]);

/// Packet types for PPPoE.
static PTYPES_PPPOE: [u32; WORDS] =
    tbl([0, 0, 0, 0, 0, 0, 0, 0, 0, 0x03FFF000]);

/// An auxiliary attribute the device programming step attaches to a
/// packet-type class.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PtypeAttrib {
    /// GTP-U PDU carrying an extension header.
    GtpPduEh,
}

/// One (packet type, attribute) pairing handed to the device alongside
/// the candidate bitmap.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PtypeAttr {
    pub ptype: u16,
    pub attrib: PtypeAttrib,
}

/// Intersect the candidate packet-type classes for the given segments.
///
/// Returns the narrowed bitmap and any auxiliary attributes implied by
/// tunnel-carried sub-types.
pub fn filter_ptypes(segs: &[Segment]) -> (PtypeBitmap, Vec<PtypeAttr>) {
    let mut ptypes = PtypeBitmap::all();
    let mut attrs = Vec::new();

    for (i, seg) in segs.iter().enumerate() {
        let outer = i == 0;
        let hdrs = seg.hdrs;

        if hdrs.contains(SegHdrs::ETH) {
            ptypes
                .intersect(if outer { &PTYPES_MAC_OFOS } else { &PTYPES_MAC_IL });
        }

        if !outer && hdrs.contains(SegHdrs::VLAN) {
            ptypes.intersect(&PTYPES_MACVLAN_IL);
        }

        if outer && hdrs.contains(SegHdrs::ARP) {
            ptypes.intersect(&PTYPES_ARP_OF);
        }

        if hdrs.contains(SegHdrs::PPPOE) {
            ptypes.intersect(&PTYPES_PPPOE);
        }

        if hdrs.contains(SegHdrs::IPV4) {
            ptypes.intersect(if outer {
                &PTYPES_IPV4_OFOS
            } else {
                &PTYPES_IPV4_IL
            });
        } else if hdrs.contains(SegHdrs::IPV6) {
            ptypes.intersect(if outer {
                &PTYPES_IPV6_OFOS
            } else {
                &PTYPES_IPV6_IL
            });
        }

        if hdrs.contains(SegHdrs::ICMP) {
            ptypes
                .intersect(if outer { &PTYPES_ICMP_OF } else { &PTYPES_ICMP_IL });
        } else if hdrs.contains(SegHdrs::UDP) {
            ptypes.intersect(&PTYPES_UDP_IL);
        } else if hdrs.contains(SegHdrs::TCP) {
            ptypes.intersect(&PTYPES_TCP_IL);
        } else if hdrs.contains(SegHdrs::SCTP) {
            ptypes.intersect(&PTYPES_SCTP_IL);
        } else if hdrs.contains(SegHdrs::GRE) {
            if outer {
                ptypes.intersect(&PTYPES_GRE_OF);
            }
        } else if hdrs.contains(SegHdrs::GTPC) {
            if outer {
                ptypes.intersect(&PTYPES_GTPC);
            }
        } else if hdrs.contains(SegHdrs::GTPC_TEID) {
            if outer {
                ptypes.intersect(&PTYPES_GTPC_TID);
            }
        } else if hdrs.intersects(SegHdrs::GTPU_IP | SegHdrs::GTPU_UP | SegHdrs::GTPU_DWN)
        {
            if outer {
                ptypes.intersect(&PTYPES_GTPU);
            }
        } else if hdrs.contains(SegHdrs::GTPU_EH) {
            if outer {
                ptypes.intersect(&PTYPES_GTPU);
            }

            // A GTP-U packet with an extension header needs the PDU
            // attribute attached to every candidate GTP-U type.
            attrs = gtpu_eh_attrs();
        }
    }

    (ptypes, attrs)
}

fn gtpu_eh_attrs() -> Vec<PtypeAttr> {
    let mut out = Vec::new();
    for (word, bits) in PTYPES_GTPU.iter().enumerate() {
        let mut bits = *bits;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            out.push(PtypeAttr {
                ptype: (word * 32 + bit as usize) as u16,
                attrib: PtypeAttrib::GtpPduEh,
            });
            bits &= bits - 1;
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn narrows_only() {
        // The filter never fails; it only intersects.
        let segs = [Segment::new(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::TCP)];
        let (ptypes, attrs) = filter_ptypes(&segs);
        assert!(attrs.is_empty());
        // Ptype 26 (word 0, bit 26) survives MAC+IPv4+TCP.
        assert!(ptypes.is_set(26));
        // ARP-only ptype does not.
        assert!(!ptypes.is_set(11));
    }

    #[test]
    fn inner_headers_use_il_tables() {
        let outer = Segment::new(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::UDP);
        let inner = Segment::new(SegHdrs::IPV4 | SegHdrs::TCP);
        let (tunneled, _) = filter_ptypes(&[outer.clone(), inner]);
        let (plain, _) = filter_ptypes(&[outer]);
        // The inner pass must strictly narrow the candidate set.
        let narrowed = (0..super::PTYPE_MAX as u16)
            .filter(|p| plain.is_set(*p) && !tunneled.is_set(*p))
            .count();
        assert!(narrowed > 0);
    }

    #[test]
    fn gtpu_eh_attaches_attributes() {
        let seg = Segment::new(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::GTPU_EH);
        let (_, attrs) = filter_ptypes(&[seg]);
        assert!(!attrs.is_empty());
        assert!(attrs.iter().all(|a| a.attrib == PtypeAttrib::GtpPduEh));
        // All attribute ptypes fall in the GTPU class range.
        assert!(attrs.iter().all(|a| a.ptype >= 329 && a.ptype <= 350));
    }
}
