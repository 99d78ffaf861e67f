// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The extraction-sequence compiler.
//!
//! Walks the matched fields of a flow's segments and assigns each to
//! word-aligned slots of a block's field vector. Sibling fields (TTL
//! and protocol, ICMP type and code) share one slot with their masks
//! OR'ed; wide fields consume consecutive slots; blocks may require
//! the vector laid out back-to-front.

use super::Block;
use super::BlockCaps;
use super::bitmap::PtypeBitmap;
use super::field::FlowField;
use super::ptype::PtypeAttr;
use super::ptype::filter_ptypes;
use super::segment::SegHdrs;
use super::segment::Segment;
use super::segment::SEG_RAW_FLD_MAX;
use crate::api::FlowError;

/// Size of one field-vector extraction word, in bytes.
pub const FV_EXTRACT_BYTES: u16 = 2;

/// The absolute ceiling on field-vector words across all blocks.
pub const MAX_FV_WORDS: usize = 48;

/// Offset marker for an unused field-vector slot.
pub const FV_OFFSET_INVALID: u16 = 0xffff;

/// Metadata identifier of the packet-flags pseudo-field extracted by
/// direction-aware blocks.
pub const MDID_PKT_FLAGS_15_0: u16 = 20;

/// Hardware protocol tag for one extraction slot. Outer and inner
/// positions of the same logical protocol carry distinct tags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProtId {
    #[default]
    Invalid,
    MacOuter,
    MacInner,
    EtypeOuter,
    EtypeInner,
    Ipv4Outer,
    Ipv4Inner,
    Ipv6Outer,
    Ipv6Inner,
    TcpInner,
    UdpOuter,
    UdpInner,
    SctpInner,
    IcmpInner,
    Icmp6Inner,
    ArpOuter,
    GreOuter,
    Pppoe,
    Meta,
    Payload,
}

/// One slot of the compiled extraction vector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FvWord {
    pub prot: ProtId,
    /// Byte offset within the protocol header.
    pub off: u16,
}

impl FvWord {
    pub const INVALID: FvWord =
        FvWord { prot: ProtId::Invalid, off: FV_OFFSET_INVALID };
}

/// Where the compiler placed one matched field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FieldExtract {
    pub prot: ProtId,
    /// Word-aligned byte offset of the first extraction word.
    pub off: u16,
    /// Bit displacement of the field within its first word.
    pub disp: u8,
    /// Running slot index at which this field started.
    pub idx: u8,
    pub mask: u16,
}

/// The output of compiling one profile's segments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledProfile {
    /// Extraction vector, `fv_words` long; unused slots are
    /// [`FvWord::INVALID`].
    pub es: Vec<FvWord>,
    /// Per-slot masks parallel to `es`; zero means full word.
    pub masks: Vec<u16>,
    pub ptypes: PtypeBitmap,
    pub attrs: Vec<PtypeAttr>,
}

struct Params {
    caps: BlockCaps,
    es: [FvWord; MAX_FV_WORDS],
    masks: [u16; MAX_FV_WORDS],
    es_cnt: u8,
}

impl Params {
    fn slot(&mut self) -> Result<usize, FlowError> {
        if self.es_cnt >= self.caps.fv_words {
            return Err(FlowError::exhausted(
                "extraction sequence exceeds block capacity",
            ));
        }

        let idx = if self.caps.reverse {
            usize::from(self.caps.fv_words - self.es_cnt - 1)
        } else {
            usize::from(self.es_cnt)
        };
        self.es_cnt += 1;
        Ok(idx)
    }
}

/// Sizes of fixed known protocol headers without header options.
const HDR_SZ_MAC: u16 = 14;
const HDR_SZ_MAC_VLAN: u16 = HDR_SZ_MAC + 2;
const HDR_SZ_IPV4: u16 = 20;
const HDR_SZ_IPV6: u16 = 40;
const HDR_SZ_ARP: u16 = 28;
const HDR_SZ_ICMP: u16 = 8;
const HDR_SZ_TCP: u16 = 20;
const HDR_SZ_UDP: u16 = 8;
const HDR_SZ_SCTP: u16 = 12;

/// Byte size of a segment's known headers; zero if the header stack is
/// incomplete (L4 without L3).
fn calc_seg_size(seg: &Segment) -> u16 {
    let mut sz = if seg.hdrs.contains(SegHdrs::VLAN) {
        HDR_SZ_MAC_VLAN
    } else {
        HDR_SZ_MAC
    };

    if seg.hdrs.contains(SegHdrs::IPV4) {
        sz += HDR_SZ_IPV4;
    } else if seg.hdrs.contains(SegHdrs::IPV6) {
        sz += HDR_SZ_IPV6;
    } else if seg.hdrs.contains(SegHdrs::ARP) {
        sz += HDR_SZ_ARP;
    } else if seg.hdrs.intersects(SegHdrs::L4_MASK) {
        // An L3 header is required if L4 is specified.
        return 0;
    }

    if seg.hdrs.contains(SegHdrs::ICMP) {
        sz += HDR_SZ_ICMP;
    } else if seg.hdrs.contains(SegHdrs::TCP) {
        sz += HDR_SZ_TCP;
    } else if seg.hdrs.contains(SegHdrs::UDP) {
        sz += HDR_SZ_UDP;
    } else if seg.hdrs.contains(SegHdrs::SCTP) {
        sz += HDR_SZ_SCTP;
    }

    sz
}

/// Resolve the protocol tag for `fld` at segment position `seg_idx`,
/// plus its sibling (if the sibling shares the extraction word).
fn resolve_prot(
    fld: FlowField,
    seg_idx: usize,
    hdrs: SegHdrs,
) -> Result<(ProtId, Option<FlowField>), FlowError> {
    use FlowField::*;

    let outer = seg_idx == 0;
    let prot = match fld {
        EthDst | EthSrc | SVlan | CVlan => {
            if outer { ProtId::MacOuter } else { ProtId::MacInner }
        }
        EthType => {
            if outer { ProtId::EtypeOuter } else { ProtId::EtypeInner }
        }
        Ipv4Dscp | Ipv4Ttl | Ipv4Prot | Ipv4Src | Ipv4Dst => {
            if outer { ProtId::Ipv4Outer } else { ProtId::Ipv4Inner }
        }
        Ipv6Dscp | Ipv6Ttl | Ipv6Prot | Ipv6Src | Ipv6Dst => {
            if outer { ProtId::Ipv6Outer } else { ProtId::Ipv6Inner }
        }
        TcpSrcPort | TcpDstPort | TcpFlags => ProtId::TcpInner,
        UdpSrcPort | UdpDstPort => ProtId::UdpInner,
        SctpSrcPort | SctpDstPort => ProtId::SctpInner,
        // GTP rides the outer UDP protocol.
        GtpcTeid | GtpuIpTeid | GtpuEhTeid | GtpuEhQfi | GtpuUpTeid
        | GtpuDwnTeid => ProtId::UdpOuter,
        PppoeSessId => ProtId::Pppoe,
        ArpSip | ArpDip | ArpSha | ArpDha | ArpOp => ProtId::ArpOuter,
        IcmpType | IcmpCode => {
            if hdrs.contains(SegHdrs::IPV4) {
                ProtId::IcmpInner
            } else {
                ProtId::Icmp6Inner
            }
        }
        GreKeyId => ProtId::GreOuter,
    };

    Ok((prot, fld.sibling()))
}

/// Consume slot 0 for the packet-flags pseudo-field extracted by
/// direction-aware blocks.
fn xtract_pkt_flags(params: &mut Params) -> Result<(), FlowError> {
    let idx = params.slot()?;
    params.es[idx] =
        FvWord { prot: ProtId::Meta, off: MDID_PKT_FLAGS_15_0 };
    Ok(())
}

/// Allocate extraction slots for one matched field, sharing words
/// already claimed by the field's sibling.
fn xtract_fld(
    params: &mut Params,
    seg: &mut Segment,
    seg_idx: usize,
    fld: FlowField,
) -> Result<(), FlowError> {
    let (prot, sib) = resolve_prot(fld, seg_idx, seg.hdrs)?;
    let info = fld.info();
    let ese_bits = FV_EXTRACT_BYTES * 8;

    // The sibling's mask joins ours when both fields are requested.
    let sib_mask = match sib {
        Some(s) if seg.match_mask & s.bit() != 0 => s.info().mask,
        _ => 0,
    };

    let xtrct = FieldExtract {
        prot,
        off: (info.off / ese_bits) * FV_EXTRACT_BYTES,
        disp: (info.off % ese_bits) as u8,
        idx: params.es_cnt,
        mask: info.mask,
    };
    seg.fields[fld.index() as usize].xtrct = xtrct;

    let cnt = (u16::from(xtrct.disp) + info.size).div_ceil(ese_bits);
    let mut off = xtrct.off;

    for _ in 0..cnt {
        // Only consume a slot if no sibling entry already extracts
        // this word.
        let shared = match sib {
            Some(s) => {
                let sx = &seg.fields[s.index() as usize].xtrct;
                sx.prot != ProtId::Invalid && sx.off == off
            }
            None => false,
        };

        if !shared {
            let idx = params.slot()?;
            params.es[idx] = FvWord { prot, off };
            params.masks[idx] = xtrct.mask | sib_mask;
        }

        off += FV_EXTRACT_BYTES;
    }

    Ok(())
}

/// Allocate extraction slots for a segment's raw byte-range fields,
/// which live strictly in the payload past the known headers.
fn xtract_raws(
    params: &mut Params,
    seg: &mut Segment,
) -> Result<(), FlowError> {
    if seg.raws.is_empty() {
        return Ok(());
    }

    if seg.raws.len() > SEG_RAW_FLD_MAX {
        return Err(FlowError::exhausted("too many raw fields"));
    }

    // Offsets within the segment headers are not supported.
    let hdrs_sz = calc_seg_size(seg);
    if hdrs_sz == 0 {
        return Err(FlowError::invalid("raw field on incomplete header stack"));
    }

    for raw in seg.raws.iter_mut() {
        if raw.off < hdrs_sz {
            return Err(FlowError::invalid(
                "raw field offset falls within known headers",
            ));
        }

        // Convert the segment-relative offset into a payload-relative
        // one.
        let off = raw.off - hdrs_sz;
        let len_bits = raw.info.src.last * 8;

        raw.info.xtrct = FieldExtract {
            prot: ProtId::Payload,
            off: (off / FV_EXTRACT_BYTES) * FV_EXTRACT_BYTES,
            disp: ((off % FV_EXTRACT_BYTES) * 8) as u8,
            idx: params.es_cnt,
            mask: 0,
        };

        let cnt = (u16::from(raw.info.xtrct.disp) + len_bits)
            .div_ceil(FV_EXTRACT_BYTES * 8);
        let mut woff = raw.info.xtrct.off;

        for _ in 0..cnt {
            let idx = params.slot()?;
            params.es[idx] = FvWord { prot: ProtId::Payload, off: woff };
            woff += FV_EXTRACT_BYTES;
        }
    }

    Ok(())
}

/// Compile an extraction sequence for `segs` against a block's
/// capabilities, recording each field's placement back into the
/// segments.
pub fn compile(
    blk: Block,
    caps: BlockCaps,
    segs: &mut [Segment],
) -> Result<CompiledProfile, FlowError> {
    assert!(usize::from(caps.fv_words) <= MAX_FV_WORDS);

    let (ptypes, attrs) = filter_ptypes(segs);
    let mut params = Params {
        caps,
        es: [FvWord::INVALID; MAX_FV_WORDS],
        masks: [0; MAX_FV_WORDS],
        es_cnt: 0,
    };

    // Direction-aware blocks extract the Rx/Tx packet-flags metadata
    // ahead of any protocol field.
    if blk == Block::Acl {
        xtract_pkt_flags(&mut params)?;
    }

    for seg_idx in 0..segs.len() {
        let mut remaining = segs[seg_idx].match_mask;
        while remaining != 0 {
            let bit = remaining.trailing_zeros() as u8;
            remaining &= remaining - 1;

            let fld = FlowField::from_index(bit).ok_or_else(|| {
                FlowError::unsupported("unrecognized match field")
            })?;
            xtract_fld(&mut params, &mut segs[seg_idx], seg_idx, fld)?;
        }

        xtract_raws(&mut params, &mut segs[seg_idx])?;
    }

    match blk {
        // Only header information is needed for RSS configuration;
        // FD entries carry their own match data.
        Block::Rss | Block::Fd | Block::Acl => {}
        Block::Sw => {
            return Err(FlowError::unsupported(
                "switch block profiles are not programmable here",
            ));
        }
    }

    let n = usize::from(caps.fv_words);
    Ok(CompiledProfile {
        es: params.es[..n].to_vec(),
        masks: params.masks[..n].to_vec(),
        ptypes,
        attrs,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::segment::FLD_OFF_INVALID;

    fn seg_with(hdrs: SegHdrs, fields: &[FlowField]) -> Segment {
        let mut seg = Segment::new(hdrs);
        for f in fields {
            seg.set_field(
                *f,
                0,
                FLD_OFF_INVALID,
                FLD_OFF_INVALID,
                false,
            );
        }
        seg
    }

    fn caps(fv_words: u8, reverse: bool) -> BlockCaps {
        BlockCaps { fv_words, reverse }
    }

    #[test]
    fn ipv4_addr_pair() {
        // ETH|IPV4 with src+dst produces exactly two IPv4 slots at
        // byte offsets 12 and 16, full-width.
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV4,
            &[FlowField::Ipv4Src, FlowField::Ipv4Dst],
        )];
        let out = compile(Block::Rss, caps(8, false), &mut segs).unwrap();

        assert_eq!(
            out.es[0],
            FvWord { prot: ProtId::Ipv4Outer, off: 12 }
        );
        assert_eq!(
            out.es[1],
            FvWord { prot: ProtId::Ipv4Outer, off: 14 }
        );
        assert_eq!(
            out.es[2],
            FvWord { prot: ProtId::Ipv4Outer, off: 16 }
        );
        assert_eq!(
            out.es[3],
            FvWord { prot: ProtId::Ipv4Outer, off: 18 }
        );
        assert_eq!(out.es[4], FvWord::INVALID);
        assert_eq!(&out.masks[..4], &[0, 0, 0, 0]);
        assert_eq!(segs[0].fields[FlowField::Ipv4Src.index() as usize].xtrct.off, 12);
        assert_eq!(segs[0].fields[FlowField::Ipv4Dst.index() as usize].xtrct.off, 16);
    }

    #[test]
    fn deterministic() {
        let mk = || {
            seg_with(
                SegHdrs::ETH | SegHdrs::IPV6 | SegHdrs::TCP,
                &[
                    FlowField::Ipv6Src,
                    FlowField::Ipv6Dst,
                    FlowField::TcpSrcPort,
                    FlowField::TcpDstPort,
                ],
            )
        };
        let mut a = [mk()];
        let mut b = [mk()];
        let out_a = compile(Block::Rss, caps(24, false), &mut a).unwrap();
        let out_b = compile(Block::Rss, caps(24, false), &mut b).unwrap();
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn sibling_pair_shares_one_slot() {
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV4,
            &[FlowField::Ipv4Ttl, FlowField::Ipv4Prot],
        )];
        let out = compile(Block::Rss, caps(8, false), &mut segs).unwrap();

        assert_eq!(out.es[0], FvWord { prot: ProtId::Ipv4Outer, off: 8 });
        assert_eq!(out.es[1], FvWord::INVALID);
        assert_eq!(out.masks[0], 0xffff);
    }

    #[test]
    fn lone_sibling_keeps_own_mask() {
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV4,
            &[FlowField::Ipv4Prot],
        )];
        let out = compile(Block::Rss, caps(8, false), &mut segs).unwrap();

        assert_eq!(out.es[0], FvWord { prot: ProtId::Ipv4Outer, off: 8 });
        assert_eq!(out.es[1], FvWord::INVALID);
        assert_eq!(out.masks[0], 0x00ff);
    }

    #[test]
    fn capacity_enforced() {
        // IPv6 src+dst is 16 words; an 8-word block cannot hold it.
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV6,
            &[FlowField::Ipv6Src, FlowField::Ipv6Dst],
        )];
        let err =
            compile(Block::Rss, caps(8, false), &mut segs).unwrap_err();
        assert_eq!(err.kind, crate::api::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn reversed_layout() {
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV4,
            &[FlowField::Ipv4Src],
        )];
        let out = compile(Block::Fd, caps(8, true), &mut segs).unwrap();

        assert_eq!(out.es[7], FvWord { prot: ProtId::Ipv4Outer, off: 12 });
        assert_eq!(out.es[6], FvWord { prot: ProtId::Ipv4Outer, off: 14 });
        assert_eq!(out.es[0], FvWord::INVALID);
    }

    #[test]
    fn acl_extracts_pkt_flags_first() {
        let mut segs = [seg_with(
            SegHdrs::ETH | SegHdrs::IPV4,
            &[FlowField::Ipv4Src],
        )];
        let out = compile(Block::Acl, caps(8, false), &mut segs).unwrap();

        assert_eq!(
            out.es[0],
            FvWord { prot: ProtId::Meta, off: MDID_PKT_FLAGS_15_0 }
        );
        assert_eq!(out.es[1], FvWord { prot: ProtId::Ipv4Outer, off: 12 });
    }

    #[test]
    fn raw_field_in_payload() {
        let mut seg = seg_with(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::UDP, &[]);
        // Known headers: 14 + 20 + 8 = 42 bytes.
        seg.add_raw_field(44, 3, 0, 4);
        let mut segs = [seg];
        let out = compile(Block::Fd, caps(8, false), &mut segs).unwrap();

        assert_eq!(out.es[0], FvWord { prot: ProtId::Payload, off: 2 });
        assert_eq!(out.es[1], FvWord { prot: ProtId::Payload, off: 4 });
        assert_eq!(out.es[2], FvWord::INVALID);
        assert_eq!(segs[0].raws[0].info.xtrct.disp, 0);
    }

    #[test]
    fn raw_field_inside_headers_rejected() {
        let mut seg = seg_with(SegHdrs::ETH | SegHdrs::IPV4 | SegHdrs::UDP, &[]);
        seg.add_raw_field(10, 2, 0, 2);
        let mut segs = [seg];
        let err =
            compile(Block::Fd, caps(8, false), &mut segs).unwrap_err();
        assert_eq!(err.kind, crate::api::ErrorKind::InvalidArgument);
    }

    #[test]
    fn unknown_field_bit_rejected() {
        let mut seg = seg_with(SegHdrs::ETH | SegHdrs::IPV4, &[]);
        seg.match_mask |= 1 << 60;
        let mut segs = [seg];
        let err =
            compile(Block::Rss, caps(8, false), &mut segs).unwrap_err();
        assert_eq!(err.kind, crate::api::ErrorKind::Unsupported);
    }
}
