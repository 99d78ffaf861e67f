// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! RSS hash configuration.
//!
//! Sits on top of the RSS block's profile registry. Each request is a
//! (VSI, hashed fields, headers, symmetric flag) tuple applied twice,
//! once against the outer-header view and once against the inner; VSIs
//! with identical configurations share one profile. A block-level
//! record list, under its own lock, remembers each distinct
//! configuration and its VSI membership so configurations can be
//! replayed after a VSI is rebuilt.

use super::Block;
use super::bitmap::VsiBitmap;
use super::device::Register;
use super::field::FlowField;
use super::profile::FindConds;
use super::profile::FlowClassifier;
use super::profile::FlowProfile;
use super::profile::ProfileId;
use super::segment::SegHdrs;
use super::segment::Segment;
use super::segment::FLD_OFF_INVALID;
use crate::api::Direction;
use crate::api::FlowError;

/// One remembered RSS configuration shared by the VSIs in `vsis`.
#[derive(Clone, Debug)]
pub struct RssCfg {
    pub hashed_flds: u64,
    pub packet_hdr: SegHdrs,
    pub symm: bool,
    pub vsis: VsiBitmap,
}

/// Segment count for the outer-header view of a request.
const RSS_OUTER_HEADERS: usize = 1;
/// Segment count for the inner-header view.
const RSS_INNER_HEADERS: usize = 2;

const RSS_SEG_HDR_L3: SegHdrs = SegHdrs::IPV4.union(SegHdrs::IPV6);
const RSS_SEG_HDR_L4: SegHdrs =
    SegHdrs::TCP.union(SegHdrs::UDP).union(SegHdrs::SCTP);
const RSS_SEG_HDR_VAL: SegHdrs =
    SegHdrs::L2_MASK.union(RSS_SEG_HDR_L3).union(RSS_SEG_HDR_L4);
/// Tunnel qualifiers accepted alongside the plain header set.
const RSS_HDRS_INNER_MASK: SegHdrs = SegHdrs::PPPOE
    .union(SegHdrs::GTPC)
    .union(SegHdrs::GTPC_TEID)
    .union(SegHdrs::GTPU);

/// Flow profile ID format:
/// [0:31] - packet match fields
/// [32:62] - protocol header
/// [63] - encapsulation flag, 0 if non-tunneled, 1 if tunneled
fn gen_prof_id(hash: u64, hdr: SegHdrs, segs_cnt: usize) -> ProfileId {
    let mut id = hash & 0xffff_ffff;
    id |= (u64::from(hdr.bits()) & 0x3fff_ffff) << 32;
    if segs_cnt > 1 {
        id |= 1 << 63;
    }
    ProfileId(id)
}

/// Build the last segment of an RSS request from its hash-field bitmap
/// and header bitmask.
fn set_rss_seg_info(
    seg: &mut Segment,
    hash_fields: u64,
    flow_hdr: SegHdrs,
) -> Result<(), FlowError> {
    let mut val = hash_fields;
    while val != 0 {
        let bit = val.trailing_zeros() as u8;
        val &= val - 1;

        if let Some(fld) = FlowField::from_index(bit) {
            seg.set_field(
                fld,
                FLD_OFF_INVALID,
                FLD_OFF_INVALID,
                FLD_OFF_INVALID,
                false,
            );
        }
    }
    seg.hdrs |= flow_hdr;

    if !(seg.hdrs - RSS_SEG_HDR_VAL - RSS_HDRS_INNER_MASK).is_empty() {
        return Err(FlowError::invalid("header not hashable"));
    }

    let l3 = u64::from((seg.hdrs & RSS_SEG_HDR_L3).bits());
    if l3 != 0 && !super::bitmap::is_pow2(l3) {
        return Err(FlowError::conflict("multiple L3 headers in hash config"));
    }

    let l4 = u64::from((seg.hdrs & RSS_SEG_HDR_L4).bits());
    if l4 != 0 && !super::bitmap::is_pow2(l4) {
        return Err(FlowError::conflict("multiple L4 headers in hash config"));
    }

    Ok(())
}

/// Symmetric-hash register geometry: byte size of the switch field
/// vector, and the number of swap-directive registers per profile.
const SW_FIELD_VECTOR_MAX: u16 = 48;
const HSYMM_REG_COUNT: u8 = 6;

impl FlowClassifier {
    /// Add an RSS configuration for `vsi`: hash over `hashed_flds`
    /// within the `addl_hdrs` header stack, optionally symmetric.
    pub fn add_rss_cfg(
        &self,
        vsi: u16,
        hashed_flds: u64,
        addl_hdrs: SegHdrs,
        symm: bool,
    ) -> Result<(), FlowError> {
        if hashed_flds == 0 || !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad hash fields or VSI"));
        }

        let mut rss = self.rss_list.lock().unwrap();
        self.add_rss_cfg_sync(
            &mut rss,
            vsi,
            hashed_flds,
            addl_hdrs,
            RSS_OUTER_HEADERS,
            symm,
        )?;
        self.add_rss_cfg_sync(
            &mut rss,
            vsi,
            hashed_flds,
            addl_hdrs,
            RSS_INNER_HEADERS,
            symm,
        )
    }

    fn add_rss_cfg_sync(
        &self,
        rss: &mut Vec<RssCfg>,
        vsi: u16,
        hashed_flds: u64,
        addl_hdrs: SegHdrs,
        segs_cnt: usize,
        symm: bool,
    ) -> Result<(), FlowError> {
        let blk = Block::Rss;
        let mut segs = vec![Segment::default(); segs_cnt];
        set_rss_seg_info(&mut segs[segs_cnt - 1], hashed_flds, addl_hdrs)?;

        // A profile with matching headers, hash fields, and this VSI
        // already associated needs at most a symmetric-flag update.
        if let Some(prof) = self.find_prof_conds(
            blk,
            Direction::Rx,
            &segs,
            vsi,
            FindConds::CHK_FLDS | FindConds::CHK_VSI,
        ) {
            if prof.symm() == symm {
                return Ok(());
            }
            prof.set_symm(symm);
            return self.update_symm(&prof);
        }

        // A profile with the same headers but different hash fields
        // loses this VSI; the VSI moves to a profile carrying the new
        // field configuration.
        if let Some(prof) = self.find_prof_conds(
            blk,
            Direction::Rx,
            &segs,
            vsi,
            FindConds::CHK_VSI,
        ) {
            self.disassoc_prof(blk, &prof, vsi)?;
            Self::rem_rss_list(rss, vsi, &prof);

            if !prof.any_vsi() {
                self.rem_prof(blk, prof.id())?;
            }
        }

        // A profile with the same fields (whatever its VSIs) can adopt
        // this VSI, unless its symmetric policy disagrees.
        if let Some(prof) = self.find_prof_conds(
            blk,
            Direction::Rx,
            &segs,
            vsi,
            FindConds::CHK_FLDS,
        ) {
            if prof.symm() != symm {
                // One profile cannot carry two symmetric-hash
                // policies.
                return Err(FlowError::unsupported(
                    "conflicting symmetric-hash settings",
                ));
            }
            self.assoc_prof(blk, &prof, vsi)?;
            Self::add_rss_list(rss, vsi, &prof);
            return Ok(());
        }

        // Nothing fits: create a new profile.
        let hdrs = segs[segs_cnt - 1].hdrs;
        let prof = self.add_prof(
            blk,
            Direction::Rx,
            gen_prof_id(hashed_flds, hdrs, segs_cnt),
            segs,
            vec![],
        )?;

        if let Err(e) = self.assoc_prof(blk, &prof, vsi) {
            // A profile no VSI could join has no reason to stay.
            let _ = self.rem_prof(blk, prof.id());
            return Err(e);
        }

        prof.set_symm(symm);
        Self::add_rss_list(rss, vsi, &prof);

        if symm {
            self.update_symm(&prof)?;
        }

        Ok(())
    }

    /// Remove the RSS configuration matching the hashed fields and
    /// headers from `vsi`.
    pub fn rem_rss_cfg(
        &self,
        vsi: u16,
        hashed_flds: u64,
        addl_hdrs: SegHdrs,
    ) -> Result<(), FlowError> {
        if hashed_flds == 0 || !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad hash fields or VSI"));
        }

        let mut rss = self.rss_list.lock().unwrap();
        self.rem_rss_cfg_sync(
            &mut rss,
            vsi,
            hashed_flds,
            addl_hdrs,
            RSS_OUTER_HEADERS,
        )?;
        self.rem_rss_cfg_sync(
            &mut rss,
            vsi,
            hashed_flds,
            addl_hdrs,
            RSS_INNER_HEADERS,
        )
    }

    fn rem_rss_cfg_sync(
        &self,
        rss: &mut Vec<RssCfg>,
        vsi: u16,
        hashed_flds: u64,
        addl_hdrs: SegHdrs,
        segs_cnt: usize,
    ) -> Result<(), FlowError> {
        let blk = Block::Rss;
        let mut segs = vec![Segment::default(); segs_cnt];
        set_rss_seg_info(&mut segs[segs_cnt - 1], hashed_flds, addl_hdrs)?;

        let prof = self
            .find_prof_conds(
                blk,
                Direction::Rx,
                &segs,
                vsi,
                FindConds::CHK_FLDS,
            )
            .ok_or_else(|| FlowError::not_found("no matching RSS profile"))?;

        self.disassoc_prof(blk, &prof, vsi)?;

        // Drop the record before deleting the flow profile.
        Self::rem_rss_list(rss, vsi, &prof);

        if !prof.any_vsi() {
            self.rem_prof(blk, prof.id())?;
        }

        Ok(())
    }

    /// The hashed-field bitmask of the first configuration for `vsi`
    /// with the given header stack.
    pub fn get_rss_cfg(&self, vsi: u16, hdrs: SegHdrs) -> Option<u64> {
        if hdrs.is_empty() || !self.dev.is_vsi_valid(vsi) {
            return None;
        }

        let rss = self.rss_list.lock().unwrap();
        rss.iter()
            .find(|r| r.vsis.is_set(vsi) && r.packet_hdr == hdrs)
            .map(|r| r.hashed_flds)
    }

    /// Re-issue every remembered configuration bound to `vsi`. Used
    /// after the VSI is recreated or reset.
    pub fn replay_rss_cfg(&self, vsi: u16) -> Result<(), FlowError> {
        if !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad VSI handle"));
        }

        let mut rss = self.rss_list.lock().unwrap();
        let bound: Vec<RssCfg> = rss
            .iter()
            .filter(|r| r.vsis.is_set(vsi))
            .cloned()
            .collect();

        for r in bound {
            self.add_rss_cfg_sync(
                &mut rss,
                vsi,
                r.hashed_flds,
                r.packet_hdr,
                RSS_OUTER_HEADERS,
                r.symm,
            )?;
            self.add_rss_cfg_sync(
                &mut rss,
                vsi,
                r.hashed_flds,
                r.packet_hdr,
                RSS_INNER_HEADERS,
                r.symm,
            )?;
        }

        Ok(())
    }

    /// Drop `vsi` from every RSS record, deleting records that empty
    /// out. The profiles themselves are untouched.
    pub fn rem_vsi_rss_list(&self, vsi: u16) {
        let mut rss = self.rss_list.lock().unwrap();
        rss.retain_mut(|r| {
            if r.vsis.is_set(vsi) {
                r.vsis.clear(vsi);
                return r.vsis.any();
            }
            true
        });
    }

    /// Disassociate `vsi` from every RSS-block profile, deleting
    /// profiles left with no VSIs.
    pub fn rem_vsi_rss_cfg(&self, vsi: u16) -> Result<(), FlowError> {
        if !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad VSI handle"));
        }

        let blk = Block::Rss;
        let mut result = Ok(());
        self.with_profiles(blk, |profs| {
            let mut keep = Vec::with_capacity(profs.len());
            for p in profs.drain(..) {
                if !result.is_ok() || !p.has_vsi(vsi) {
                    keep.push(p);
                    continue;
                }
                if let Err(e) = self.disassoc_prof(blk, &p, vsi) {
                    result = Err(e);
                    keep.push(p);
                    continue;
                }
                if p.any_vsi() {
                    keep.push(p);
                    continue;
                }
                if let Err(e) = self.rem_prof_sync(blk, &p) {
                    result = Err(e);
                    keep.push(p);
                }
            }
            *profs = keep;
        });

        result
    }

    /// Record `vsi` against the profile's configuration, creating the
    /// record on first use. RSS-list lock held by the caller.
    fn add_rss_list(rss: &mut Vec<RssCfg>, vsi: u16, prof: &FlowProfile) {
        let seg = prof.segs().last().unwrap();

        for r in rss.iter_mut() {
            if r.hashed_flds == seg.match_mask && r.packet_hdr == seg.hdrs {
                r.vsis.set(vsi);
                return;
            }
        }

        let mut vsis = VsiBitmap::new();
        vsis.set(vsi);
        rss.push(RssCfg {
            hashed_flds: seg.match_mask,
            packet_hdr: seg.hdrs,
            symm: prof.symm(),
            vsis,
        });
    }

    /// Drop `vsi` from the record matching the profile's
    /// configuration. RSS-list lock held by the caller.
    fn rem_rss_list(rss: &mut Vec<RssCfg>, vsi: u16, prof: &FlowProfile) {
        let seg = prof.segs().last().unwrap();

        if let Some(pos) = rss.iter().position(|r| {
            r.hashed_flds == seg.match_mask && r.packet_hdr == seg.hdrs
        }) {
            rss[pos].vsis.clear(vsi);
            if !rss[pos].vsis.any() {
                rss.remove(pos);
            }
        }
    }

    fn config_xor_word(&self, prof: super::device::HwProfileId, src: u8, dst: u8) {
        let shift = u32::from(src % 4) * 8;
        let val = u32::from(dst) | 0x80;
        let reg = Register::Hsymm { prof, index: src / 4 };

        let mut word = self.regs.read32(reg);
        word = (word & !(0xff << shift)) | (val << shift);
        self.regs.write32(reg, word);
    }

    fn config_xor(
        &self,
        prof: super::device::HwProfileId,
        src: u8,
        dst: u8,
        len: u8,
    ) {
        let last =
            (SW_FIELD_VECTOR_MAX / super::extract::FV_EXTRACT_BYTES - 1) as u8;

        for i in 0..len {
            // The field-vector index in the swap registers is
            // inverted relative to the extraction sequence.
            self.config_xor_word(prof, last - (src + i), last - (dst + i));
            self.config_xor_word(prof, last - (dst + i), last - (src + i));
        }
    }

    /// Reprogram the profile's symmetric-hash swap registers: cleared
    /// to default, then paired byte-swap directives for each matched
    /// src/dst field pair of the last segment.
    fn update_symm(&self, prof: &FlowProfile) -> Result<(), FlowError> {
        let hw_prof = self.get_hw_prof_id(Block::Rss, prof.id())?;

        for m in 0..HSYMM_REG_COUNT {
            self.regs.write32(Register::Hsymm { prof: hw_prof, index: m }, 0);
        }

        if !prof.symm() {
            return Ok(());
        }

        log::debug!(
            "profile {}: programming symmetric hash registers",
            prof.id()
        );

        let seg = prof.segs().last().unwrap();
        let xtrct =
            |f: FlowField| seg.fields[f.index() as usize].xtrct;
        let pairs = [
            (FlowField::Ipv4Src, FlowField::Ipv4Dst, 2u8),
            (FlowField::Ipv6Src, FlowField::Ipv6Dst, 8),
            (FlowField::TcpSrcPort, FlowField::TcpDstPort, 1),
            (FlowField::UdpSrcPort, FlowField::UdpDstPort, 1),
            (FlowField::SctpSrcPort, FlowField::SctpDstPort, 1),
        ];

        for (src, dst, len) in pairs {
            let (s, d) = (xtrct(src), xtrct(dst));
            if s.prot != super::extract::ProtId::Invalid
                && d.prot != super::extract::ProtId::Invalid
            {
                self.config_xor(hw_prof, s.idx, d.idx, len);
            }
        }

        Ok(())
    }
}
