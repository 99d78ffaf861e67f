// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow profiles and entries.
//!
//! A profile binds (direction, segments, matched fields) to a compiled
//! extraction sequence programmed into one classification block. Each
//! profile tracks the VSIs bound to it and the concrete match entries
//! instantiated from it. Profiles live on a per-block list guarded by
//! a per-block lock; each profile guards its own entry list with a
//! finer lock so entry churn on one profile does not serialize against
//! lookups elsewhere in the block.

use super::Block;
use super::ClassifierCaps;
use super::bitmap::VsiBitmap;
use super::device::ProfileDevice;
use super::device::HwProfileId;
use super::device::RegisterIo;
use super::extract;
use super::extract::FvWord;
use super::rss::RssCfg;
use super::segment::SEG_MAX;
use super::segment::Segment;
use super::segment::validate_headers;
use crate::api::Direction;
use crate::api::FlowError;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

/// Software flow-profile ID, unique within a block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ProfileId(pub u64);

impl Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle to an installed flow entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntryHandle(pub u64);

/// Relative priority of a flow entry within its profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowPriority {
    Low,
    Normal,
    High,
}

/// One concrete match entry instantiated from a profile.
#[derive(Clone, Debug)]
pub struct FlowEntry {
    /// Caller-assigned ID; the lookup key for [`FlowClassifier::find_entry`].
    pub id: u64,
    pub handle: EntryHandle,
    pub vsi: u16,
    pub priority: FlowPriority,
    /// Opaque match values/masks buffer.
    pub data: Vec<u8>,
    /// Opaque actions buffer.
    pub acts: Vec<u8>,
}

/// A compiled flow profile installed into one classification block.
#[derive(Debug)]
pub struct FlowProfile {
    id: ProfileId,
    dir: Direction,
    segs: Vec<Segment>,
    es: Vec<FvWord>,
    masks: Vec<u16>,
    /// Default actions copied at creation; opaque to this layer.
    acts: Vec<u8>,
    /// Symmetric-hash flag; meaningful for RSS profiles only.
    symm: AtomicBool,
    vsis: Mutex<VsiBitmap>,
    entries: Mutex<Vec<FlowEntry>>,
}

impl FlowProfile {
    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn segs(&self) -> &[Segment] {
        &self.segs
    }

    /// The compiled extraction sequence and its parallel mask array.
    pub fn extraction(&self) -> (&[FvWord], &[u16]) {
        (&self.es, &self.masks)
    }

    pub fn default_acts(&self) -> &[u8] {
        &self.acts
    }

    pub fn symm(&self) -> bool {
        self.symm.load(Ordering::Relaxed)
    }

    pub(crate) fn set_symm(&self, symm: bool) {
        self.symm.store(symm, Ordering::Relaxed);
    }

    pub fn has_vsi(&self, vsi: u16) -> bool {
        self.vsis.lock().unwrap().is_set(vsi)
    }

    pub fn any_vsi(&self) -> bool {
        self.vsis.lock().unwrap().any()
    }

    pub fn vsi_snapshot(&self) -> VsiBitmap {
        *self.vsis.lock().unwrap()
    }

    pub fn num_entries(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

bitflags::bitflags! {
    /// Additional conditions for a profile lookup.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub(crate) struct FindConds: u32 {
        /// Matched-field bitmasks must also be equal.
        const CHK_FLDS = 1 << 0;
        /// The given VSI must be associated.
        const CHK_VSI = 1 << 1;
        /// Ignore the direction.
        const NOT_CHK_DIR = 1 << 2;
    }
}

struct BlockProfiles {
    profiles: Mutex<Vec<Arc<FlowProfile>>>,
}

/// The per-device profile registry across all classification blocks,
/// plus the RSS configuration cache built on top of the RSS block.
pub struct FlowClassifier {
    pub(crate) dev: Arc<dyn ProfileDevice>,
    pub(crate) regs: Arc<dyn RegisterIo>,
    pub(crate) caps: ClassifierCaps,
    blocks: [BlockProfiles; Block::COUNT],
    /// RSS-record cache; a different index over the RSS block's
    /// profiles, under its own lock.
    pub(crate) rss_list: Mutex<Vec<RssCfg>>,
    next_entry_handle: AtomicU64,
}

impl FlowClassifier {
    pub fn new(
        dev: Arc<dyn ProfileDevice>,
        regs: Arc<dyn RegisterIo>,
        caps: ClassifierCaps,
    ) -> Self {
        Self {
            dev,
            regs,
            caps,
            blocks: [
                BlockProfiles { profiles: Mutex::new(Vec::new()) },
                BlockProfiles { profiles: Mutex::new(Vec::new()) },
                BlockProfiles { profiles: Mutex::new(Vec::new()) },
                BlockProfiles { profiles: Mutex::new(Vec::new()) },
            ],
            rss_list: Mutex::new(Vec::new()),
            next_entry_handle: AtomicU64::new(1),
        }
    }

    fn profiles(
        &self,
        blk: Block,
    ) -> MutexGuard<'_, Vec<Arc<FlowProfile>>> {
        self.blocks[blk.index()].profiles.lock().unwrap()
    }

    /// Find a profile matching headers and conditions.
    pub(crate) fn find_prof_conds(
        &self,
        blk: Block,
        dir: Direction,
        segs: &[Segment],
        vsi: u16,
        conds: FindConds,
    ) -> Option<Arc<FlowProfile>> {
        let profs = self.profiles(blk);

        for p in profs.iter() {
            if p.dir != dir && !conds.contains(FindConds::NOT_CHK_DIR) {
                continue;
            }
            if segs.is_empty() || segs.len() != p.segs.len() {
                continue;
            }
            if conds.contains(FindConds::CHK_VSI)
                && self.dev.is_vsi_valid(vsi)
                && !p.has_vsi(vsi)
            {
                continue;
            }

            // Protocol headers must match at every position; matched
            // fields are checked only when asked.
            let all = segs.iter().zip(p.segs.iter()).all(|(a, b)| {
                a.hdrs == b.hdrs
                    && (!conds.contains(FindConds::CHK_FLDS)
                        || a.match_mask == b.match_mask)
            });
            if all {
                return Some(Arc::clone(p));
            }
        }

        None
    }

    /// Look up a profile by headers and matched fields.
    pub fn find_prof(
        &self,
        blk: Block,
        dir: Direction,
        segs: &[Segment],
    ) -> Option<ProfileId> {
        self.find_prof_conds(blk, dir, segs, u16::MAX, FindConds::CHK_FLDS)
            .map(|p| p.id)
    }

    /// Look up a profile by its unique ID.
    pub fn find_prof_id(
        &self,
        blk: Block,
        id: ProfileId,
    ) -> Option<Arc<FlowProfile>> {
        self.profiles(blk).iter().find(|p| p.id == id).map(Arc::clone)
    }

    /// Add a flow profile for the given packet segments and matched
    /// fields. All-or-nothing: any failure after partial work releases
    /// everything allocated so far.
    pub fn add_prof(
        &self,
        blk: Block,
        dir: Direction,
        id: ProfileId,
        segs: Vec<Segment>,
        acts: Vec<u8>,
    ) -> Result<Arc<FlowProfile>, FlowError> {
        if segs.len() > SEG_MAX {
            return Err(FlowError::exhausted("too many packet segments"));
        }
        if segs.is_empty() {
            return Err(FlowError::invalid("no packet segments"));
        }

        validate_headers(&segs)?;

        let mut profs = self.profiles(blk);
        if profs.iter().any(|p| p.id == id) {
            return Err(FlowError::conflict(format!(
                "profile {} already exists",
                id
            )));
        }

        // The caller's segments are copied into the profile; the
        // compiler records each field's placement as it goes.
        let mut segs = segs;
        let compiled =
            extract::compile(blk, self.caps.block(blk), &mut segs)?;

        self.dev.add_profile(
            blk,
            id,
            &compiled.ptypes,
            &compiled.attrs,
            &compiled.es,
            &compiled.masks,
        )?;

        let prof = Arc::new(FlowProfile {
            id,
            dir,
            segs,
            es: compiled.es,
            masks: compiled.masks,
            acts,
            symm: AtomicBool::new(false),
            vsis: Mutex::new(VsiBitmap::new()),
            entries: Mutex::new(Vec::new()),
        });
        log::debug!("block {:?}: added profile {}", blk, id);
        profs.push(Arc::clone(&prof));

        Ok(prof)
    }

    /// Remove a flow profile and every entry still linked to it. The
    /// profile must have no VSIs associated.
    pub fn rem_prof(&self, blk: Block, id: ProfileId) -> Result<(), FlowError> {
        let mut profs = self.profiles(blk);
        let pos = profs
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| FlowError::not_found("no such profile"))?;

        self.rem_prof_sync(blk, &profs[pos].clone())?;
        profs.remove(pos);
        Ok(())
    }

    /// Tear down `prof`'s entries and hardware state. The caller holds
    /// the block's profile-list lock and unlinks on success.
    pub(crate) fn rem_prof_sync(
        &self,
        blk: Block,
        prof: &Arc<FlowProfile>,
    ) -> Result<(), FlowError> {
        if prof.any_vsi() {
            return Err(FlowError::conflict(
                "profile still has VSIs associated",
            ));
        }

        // Remove all remaining flow entries before removing the flow
        // profile itself.
        {
            let mut entries = prof.entries.lock().unwrap();
            // Most-recently-inserted first, same as iteration order.
            for e in entries.drain(..) {
                log::trace!(
                    "profile {}: dropping entry {:#x}",
                    prof.id,
                    e.id
                );
            }
        }

        self.dev.remove_profile(blk, prof.id)?;
        log::debug!("block {:?}: removed profile {}", blk, prof.id);
        Ok(())
    }

    /// The hardware profile ID backing `id`.
    pub fn get_hw_prof_id(
        &self,
        blk: Block,
        id: ProfileId,
    ) -> Result<HwProfileId, FlowError> {
        self.dev
            .hw_profile_id(blk, id)
            .ok_or_else(|| FlowError::not_found("profile not programmed"))
    }

    /// Bind `vsi` to the profile, a no-op if already bound.
    pub(crate) fn assoc_prof(
        &self,
        blk: Block,
        prof: &FlowProfile,
        vsi: u16,
    ) -> Result<(), FlowError> {
        let mut vsis = prof.vsis.lock().unwrap();
        if !vsis.is_set(vsi) {
            self.dev.add_vsi_binding(
                blk,
                self.dev.hw_vsi_num(vsi),
                prof.id,
            )?;
            vsis.set(vsi);
        }
        Ok(())
    }

    /// Unbind `vsi` from the profile, a no-op if not bound.
    pub(crate) fn disassoc_prof(
        &self,
        blk: Block,
        prof: &FlowProfile,
        vsi: u16,
    ) -> Result<(), FlowError> {
        let mut vsis = prof.vsis.lock().unwrap();
        if vsis.is_set(vsi) {
            self.dev.remove_vsi_binding(
                blk,
                self.dev.hw_vsi_num(vsi),
                prof.id,
            )?;
            vsis.clear(vsi);
        }
        Ok(())
    }

    /// Associate a VSI with a profile by ID.
    pub fn assoc_vsi(
        &self,
        blk: Block,
        id: ProfileId,
        vsi: u16,
    ) -> Result<(), FlowError> {
        if !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad VSI handle"));
        }
        let prof = self
            .find_prof_id(blk, id)
            .ok_or_else(|| FlowError::not_found("no such profile"))?;
        self.assoc_prof(blk, &prof, vsi)
    }

    /// Disassociate a VSI from a profile by ID.
    pub fn disassoc_vsi(
        &self,
        blk: Block,
        id: ProfileId,
        vsi: u16,
    ) -> Result<(), FlowError> {
        if !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad VSI handle"));
        }
        let prof = self
            .find_prof_id(blk, id)
            .ok_or_else(|| FlowError::not_found("no such profile"))?;
        self.disassoc_prof(blk, &prof, vsi)
    }

    /// Add a flow entry to a profile, associating the VSI with the
    /// profile if it is not already.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &self,
        blk: Block,
        prof_id: ProfileId,
        entry_id: u64,
        vsi: u16,
        priority: FlowPriority,
        data: Vec<u8>,
        acts: Vec<u8>,
    ) -> Result<EntryHandle, FlowError> {
        // No flow-entry data is expected for RSS.
        if data.is_empty() && blk != Block::Rss {
            return Err(FlowError::invalid("missing entry match data"));
        }
        if !self.dev.is_vsi_valid(vsi) {
            return Err(FlowError::invalid("bad VSI handle"));
        }

        let prof = {
            let profs = self.profiles(blk);
            let prof = profs
                .iter()
                .find(|p| p.id == prof_id)
                .map(Arc::clone)
                .ok_or_else(|| FlowError::not_found("no such profile"))?;
            self.assoc_prof(blk, &prof, vsi)?;
            prof
        };

        match blk {
            // RSS adds only one entry per VSI per profile; FD entries
            // carry real match data.
            Block::Rss | Block::Fd | Block::Acl => {}
            Block::Sw => {
                return Err(FlowError::unsupported(
                    "entries are not supported on this block",
                ));
            }
        }

        let handle = EntryHandle(
            self.next_entry_handle.fetch_add(1, Ordering::Relaxed),
        );
        let entry = FlowEntry {
            id: entry_id,
            handle,
            vsi,
            priority,
            data,
            acts,
        };

        if blk != Block::Acl {
            // ACL handles its own entry management.
            prof.entries.lock().unwrap().insert(0, entry);
        }

        Ok(handle)
    }

    /// Remove a flow entry by handle.
    pub fn rem_entry(
        &self,
        blk: Block,
        handle: EntryHandle,
    ) -> Result<(), FlowError> {
        let profs = self.profiles(blk);
        for p in profs.iter() {
            let mut entries = p.entries.lock().unwrap();
            if let Some(pos) = entries.iter().position(|e| e.handle == handle)
            {
                entries.remove(pos);
                return Ok(());
            }
        }

        Err(FlowError::not_found("no such entry"))
    }

    /// Look for a flow entry with the given caller-assigned ID in all
    /// profiles of the block. O(profiles x entries); lookup is a
    /// control-plane operation.
    pub fn find_entry(&self, blk: Block, entry_id: u64) -> Option<EntryHandle> {
        let profs = self.profiles(blk);
        for p in profs.iter() {
            let entries = p.entries.lock().unwrap();
            if let Some(e) = entries.iter().find(|e| e.id == entry_id) {
                return Some(e.handle);
            }
        }

        None
    }

    /// Visit the profiles of `blk` most-recently-added last.
    pub(crate) fn with_profiles<R>(
        &self,
        blk: Block,
        f: impl FnOnce(&mut Vec<Arc<FlowProfile>>) -> R,
    ) -> R {
        f(&mut self.profiles(blk))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::api::ErrorKind;
    use crate::engine::bitmap::PtypeBitmap;
    use crate::engine::device::Register;
    use crate::engine::ptype::PtypeAttr;
    use std::collections::BTreeMap;
    use std::collections::BTreeSet;

    /// Profile device recording programmed state.
    #[derive(Default)]
    pub struct MockProfileDevice {
        pub profiles: Mutex<BTreeSet<(usize, u64)>>,
        pub bindings: Mutex<BTreeSet<(usize, u16, u64)>>,
        pub fail_add: AtomicBool,
        pub fail_bind: AtomicBool,
    }

    impl ProfileDevice for MockProfileDevice {
        fn add_profile(
            &self,
            blk: Block,
            id: ProfileId,
            _ptypes: &PtypeBitmap,
            _attrs: &[PtypeAttr],
            _es: &[FvWord],
            _masks: &[u16],
        ) -> Result<(), FlowError> {
            if self.fail_add.load(Ordering::Relaxed) {
                return Err(FlowError::device("profile add refused"));
            }
            self.profiles.lock().unwrap().insert((blk.index(), id.0));
            Ok(())
        }

        fn remove_profile(
            &self,
            blk: Block,
            id: ProfileId,
        ) -> Result<(), FlowError> {
            if !self
                .profiles
                .lock()
                .unwrap()
                .remove(&(blk.index(), id.0))
            {
                return Err(FlowError::device("no hw profile"));
            }
            Ok(())
        }

        fn hw_profile_id(
            &self,
            blk: Block,
            id: ProfileId,
        ) -> Option<HwProfileId> {
            let profs = self.profiles.lock().unwrap();
            profs
                .iter()
                .position(|p| *p == (blk.index(), id.0))
                .map(|i| HwProfileId(i as u8))
        }

        fn add_vsi_binding(
            &self,
            blk: Block,
            hw_vsi: u16,
            id: ProfileId,
        ) -> Result<(), FlowError> {
            if self.fail_bind.load(Ordering::Relaxed) {
                return Err(FlowError::device("binding refused"));
            }
            self.bindings
                .lock()
                .unwrap()
                .insert((blk.index(), hw_vsi, id.0));
            Ok(())
        }

        fn remove_vsi_binding(
            &self,
            blk: Block,
            hw_vsi: u16,
            id: ProfileId,
        ) -> Result<(), FlowError> {
            self.bindings
                .lock()
                .unwrap()
                .remove(&(blk.index(), hw_vsi, id.0));
            Ok(())
        }
    }

    /// Register file backed by a map.
    #[derive(Default)]
    pub struct MockRegs {
        pub regs: Mutex<BTreeMap<(u8, u8), u32>>,
    }

    impl RegisterIo for MockRegs {
        fn read32(&self, reg: Register) -> u32 {
            let Register::Hsymm { prof, index } = reg;
            *self.regs.lock().unwrap().get(&(prof.0, index)).unwrap_or(&0)
        }

        fn write32(&self, reg: Register, val: u32) {
            let Register::Hsymm { prof, index } = reg;
            self.regs.lock().unwrap().insert((prof.0, index), val);
        }
    }

    pub fn classifier() -> FlowClassifier {
        FlowClassifier::new(
            Arc::new(MockProfileDevice::default()),
            Arc::new(MockRegs::default()),
            ClassifierCaps::default(),
        )
    }

    pub fn classifier_with(
        dev: Arc<MockProfileDevice>,
        regs: Arc<MockRegs>,
    ) -> FlowClassifier {
        FlowClassifier::new(dev, regs, ClassifierCaps::default())
    }

    pub use crate::engine::segment::FLD_OFF_INVALID;

    pub fn seg(
        hdrs: crate::engine::segment::SegHdrs,
        fields: &[crate::engine::field::FlowField],
    ) -> Segment {
        let mut s = Segment::new(hdrs);
        for f in fields {
            s.set_field(*f, 0, FLD_OFF_INVALID, FLD_OFF_INVALID, false);
        }
        s
    }

    pub fn assert_kind(err: FlowError, kind: ErrorKind) {
        assert_eq!(err.kind, kind, "{}", err);
    }
}
