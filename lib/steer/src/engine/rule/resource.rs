// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Deduplicated hardware-resource caches.
//!
//! Every cacheable action resource follows one protocol: compute a
//! value key, scan the device-shared cache list for a structural
//! match, and either take another reference or materialize the
//! hardware object and push the new entry at the head of the list.
//! Release is symmetric; the last reference destroys the hardware
//! object and unlinks the entry. Lists are shared process-wide per
//! device instance.

use super::super::device::ActionHandle;
use super::super::device::MatcherHandle;
use super::super::device::ModifyCmd;
use super::super::device::ReformatKind;
use super::super::device::RuleDevice;
use super::super::device::TableHandle;
use super::super::device::TableType;
use super::counter::CounterManager;
use super::match_buf::MatchBuf;
use crate::api::FlowError;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

fn take_ref(refcnt: &AtomicU32, what: &str) {
    let prev = refcnt.fetch_add(1, Ordering::AcqRel);
    log::debug!("{} resource: refcnt {}++", what, prev);
}

/// True when the last reference was dropped. Releasing an already-dead
/// resource is a caller bug, not a tolerated state.
fn drop_ref(refcnt: &AtomicU32, what: &str) -> bool {
    let prev = refcnt.fetch_sub(1, Ordering::AcqRel);
    assert!(prev > 0, "over-release of {} resource", what);
    log::debug!("{} resource: refcnt {}--", what, prev);
    prev == 1
}

/// An encapsulation buffer or decapsulation marker.
#[derive(Debug)]
pub struct EncapDecapResource {
    pub kind: ReformatKind,
    pub ft_type: TableType,
    pub root: bool,
    pub buf: Vec<u8>,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// A combined header-rewrite program.
#[derive(Debug)]
pub struct ModifyHdrResource {
    pub ft_type: TableType,
    pub root: bool,
    pub cmds: Vec<ModifyCmd>,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// A shared flow table, referenced by matchers and jump actions.
#[derive(Debug)]
pub struct TableResource {
    pub ty: TableType,
    pub id: u32,
    pub handle: TableHandle,
    refcnt: AtomicU32,
}

/// A jump-to-table binding.
#[derive(Debug)]
pub struct JumpTblResource {
    pub tbl: Arc<TableResource>,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// A port-redirect binding.
#[derive(Debug)]
pub struct PortIdResource {
    pub port: u16,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// A push-VLAN tag binding.
#[derive(Debug)]
pub struct PushVlanResource {
    pub ft_type: TableType,
    /// Ethertype in the high half, TCI in the low.
    pub vlan_tag: u32,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// A mark/flag tag binding.
#[derive(Debug)]
pub struct TagResource {
    pub tag: u32,
    pub action: ActionHandle,
    refcnt: AtomicU32,
}

/// The per-rule hardware matcher object.
#[derive(Debug)]
pub struct MatcherResource {
    pub crc: u32,
    pub priority: u16,
    pub ty: TableType,
    pub group: u32,
    pub mask: MatchBuf,
    pub handle: MatcherHandle,
    pub tbl: Arc<TableResource>,
    refcnt: AtomicU32,
}

/// What a tentative matcher looks like before registration.
#[derive(Clone, Debug)]
pub struct MatcherSpec {
    pub crc: u32,
    pub priority: u16,
    pub ty: TableType,
    pub group: u32,
    pub criteria: u8,
    pub mask: MatchBuf,
}

/// Process-wide state shared by every port of one device instance:
/// the resource caches and the counter manager.
pub struct SharedCtx {
    dev: Arc<dyn RuleDevice>,
    /// Number of ports sharing this context.
    ports: AtomicU32,
    /// Serializes translate/apply/remove/destroy across ports. Taken
    /// only when the context is actually shared; a single-port device
    /// has no concurrent access to exclude.
    dv_lock: Mutex<()>,
    encaps_decaps: Mutex<Vec<Arc<EncapDecapResource>>>,
    modify_cmds: Mutex<Vec<Arc<ModifyHdrResource>>>,
    tables: Mutex<Vec<Arc<TableResource>>>,
    jump_tbls: Mutex<Vec<Arc<JumpTblResource>>>,
    port_actions: Mutex<Vec<Arc<PortIdResource>>>,
    push_vlans: Mutex<Vec<Arc<PushVlanResource>>>,
    tags: Mutex<Vec<Arc<TagResource>>>,
    matchers: Mutex<Vec<Arc<MatcherResource>>>,
    pub counters: CounterManager,
}

impl SharedCtx {
    pub fn new(dev: Arc<dyn RuleDevice>) -> Arc<Self> {
        Arc::new(Self {
            dev,
            ports: AtomicU32::new(0),
            dv_lock: Mutex::new(()),
            encaps_decaps: Mutex::new(Vec::new()),
            modify_cmds: Mutex::new(Vec::new()),
            tables: Mutex::new(Vec::new()),
            jump_tbls: Mutex::new(Vec::new()),
            port_actions: Mutex::new(Vec::new()),
            push_vlans: Mutex::new(Vec::new()),
            tags: Mutex::new(Vec::new()),
            matchers: Mutex::new(Vec::new()),
            counters: CounterManager::new(),
        })
    }

    pub fn dev(&self) -> &Arc<dyn RuleDevice> {
        &self.dev
    }

    pub fn attach_port(&self) {
        self.ports.fetch_add(1, Ordering::AcqRel);
    }

    pub fn detach_port(&self) {
        let prev = self.ports.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0);
    }

    /// Lock the shared context, but only if more than one port shares
    /// it.
    pub fn shared_lock(&self) -> Option<MutexGuard<'_, ()>> {
        if self.ports.load(Ordering::Acquire) > 1 {
            Some(self.dv_lock.lock().unwrap())
        } else {
            None
        }
    }

    /// Find or create an encap/decap reformat resource.
    pub fn register_encap_decap(
        &self,
        kind: ReformatKind,
        ft_type: TableType,
        root: bool,
        buf: Vec<u8>,
    ) -> Result<Arc<EncapDecapResource>, FlowError> {
        let mut cache = self.encaps_decaps.lock().unwrap();
        if let Some(hit) = cache.iter().find(|r| {
            r.kind == kind
                && r.ft_type == ft_type
                && r.root == root
                && r.buf == buf
        }) {
            take_ref(&hit.refcnt, "encap/decap");
            return Ok(Arc::clone(hit));
        }

        let action =
            self.dev.create_packet_reformat(kind, ft_type, root, &buf)?;
        let res = Arc::new(EncapDecapResource {
            kind,
            ft_type,
            root,
            buf,
            action,
            refcnt: AtomicU32::new(1),
        });
        log::debug!("new encap/decap resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_encap_decap(&self, res: &Arc<EncapDecapResource>) {
        if drop_ref(&res.refcnt, "encap/decap") {
            self.dev.destroy_action(res.action);
            self.encaps_decaps
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Find or create a modify-header program resource.
    pub fn register_modify_hdr(
        &self,
        ft_type: TableType,
        root: bool,
        cmds: Vec<ModifyCmd>,
    ) -> Result<Arc<ModifyHdrResource>, FlowError> {
        let mut cache = self.modify_cmds.lock().unwrap();
        if let Some(hit) = cache.iter().find(|r| {
            r.ft_type == ft_type && r.root == root && r.cmds == cmds
        }) {
            take_ref(&hit.refcnt, "modify-header");
            return Ok(Arc::clone(hit));
        }

        let action = self.dev.create_modify_header(ft_type, root, &cmds)?;
        let res = Arc::new(ModifyHdrResource {
            ft_type,
            root,
            cmds,
            action,
            refcnt: AtomicU32::new(1),
        });
        log::debug!("new modify-header resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_modify_hdr(&self, res: &Arc<ModifyHdrResource>) {
        if drop_ref(&res.refcnt, "modify-header") {
            self.dev.destroy_action(res.action);
            self.modify_cmds
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Get the flow table keyed by (family, table id), creating it on
    /// first use.
    pub fn get_table(
        &self,
        ty: TableType,
        id: u32,
    ) -> Result<Arc<TableResource>, FlowError> {
        let mut cache = self.tables.lock().unwrap();
        if let Some(hit) =
            cache.iter().find(|t| t.ty == ty && t.id == id)
        {
            take_ref(&hit.refcnt, "flow-table");
            return Ok(Arc::clone(hit));
        }

        let handle = self.dev.create_flow_table(ty, id)?;
        let res = Arc::new(TableResource {
            ty,
            id,
            handle,
            refcnt: AtomicU32::new(1),
        });
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_table(&self, res: &Arc<TableResource>) {
        if drop_ref(&res.refcnt, "flow-table") {
            self.dev.destroy_flow_table(res.handle);
            self.tables.lock().unwrap().retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Find or create a jump binding to the given table.
    pub fn register_jump(
        &self,
        tbl: Arc<TableResource>,
    ) -> Result<Arc<JumpTblResource>, FlowError> {
        let mut cache = self.jump_tbls.lock().unwrap();
        if let Some(hit) =
            cache.iter().find(|j| Arc::ptr_eq(&j.tbl, &tbl))
        {
            take_ref(&hit.refcnt, "jump-table");
            // The tentative table reference is redundant with the one
            // the cached binding already holds.
            self.release_table(&tbl);
            return Ok(Arc::clone(hit));
        }

        let action = self.dev.create_dest_table(tbl.handle)?;
        let res = Arc::new(JumpTblResource {
            tbl,
            action,
            refcnt: AtomicU32::new(1),
        });
        log::debug!("new jump table resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_jump(&self, res: &Arc<JumpTblResource>) {
        if drop_ref(&res.refcnt, "jump-table") {
            self.dev.destroy_action(res.action);
            self.jump_tbls
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
            self.release_table(&res.tbl);
        }
    }

    /// Find or create a port-redirect binding.
    pub fn register_port_id(
        &self,
        port: u16,
    ) -> Result<Arc<PortIdResource>, FlowError> {
        let mut cache = self.port_actions.lock().unwrap();
        if let Some(hit) = cache.iter().find(|p| p.port == port) {
            take_ref(&hit.refcnt, "port-id");
            return Ok(Arc::clone(hit));
        }

        let action = self.dev.create_dest_port(port)?;
        let res = Arc::new(PortIdResource {
            port,
            action,
            refcnt: AtomicU32::new(1),
        });
        log::debug!("new port-id resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_port_id(&self, res: &Arc<PortIdResource>) {
        if drop_ref(&res.refcnt, "port-id") {
            self.dev.destroy_action(res.action);
            self.port_actions
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Find or create a push-VLAN binding for the given tag and table
    /// family.
    pub fn register_push_vlan(
        &self,
        ft_type: TableType,
        vlan_tag: u32,
    ) -> Result<Arc<PushVlanResource>, FlowError> {
        let mut cache = self.push_vlans.lock().unwrap();
        if let Some(hit) = cache
            .iter()
            .find(|p| p.vlan_tag == vlan_tag && p.ft_type == ft_type)
        {
            take_ref(&hit.refcnt, "push-vlan");
            return Ok(Arc::clone(hit));
        }

        let action = self.dev.create_push_vlan(ft_type, vlan_tag)?;
        let res = Arc::new(PushVlanResource {
            ft_type,
            vlan_tag,
            action,
            refcnt: AtomicU32::new(1),
        });
        log::debug!("new push-vlan resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_push_vlan(&self, res: &Arc<PushVlanResource>) {
        if drop_ref(&res.refcnt, "push-vlan") {
            self.dev.destroy_action(res.action);
            self.push_vlans
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Find or create a mark-tag binding.
    pub fn register_tag(
        &self,
        tag: u32,
    ) -> Result<Arc<TagResource>, FlowError> {
        let mut cache = self.tags.lock().unwrap();
        if let Some(hit) = cache.iter().find(|t| t.tag == tag) {
            take_ref(&hit.refcnt, "tag");
            return Ok(Arc::clone(hit));
        }

        let action = self.dev.create_tag(tag)?;
        let res =
            Arc::new(TagResource { tag, action, refcnt: AtomicU32::new(1) });
        log::debug!("new tag resource: refcnt 1");
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_tag(&self, res: &Arc<TagResource>) {
        if drop_ref(&res.refcnt, "tag") {
            self.dev.destroy_action(res.action);
            self.tags.lock().unwrap().retain(|r| !Arc::ptr_eq(r, res));
        }
    }

    /// Find or create the matcher for a rule's mask and placement.
    pub fn register_matcher(
        &self,
        spec: MatcherSpec,
    ) -> Result<Arc<MatcherResource>, FlowError> {
        let mut cache = self.matchers.lock().unwrap();
        if let Some(hit) = cache.iter().find(|m| {
            m.crc == spec.crc
                && m.priority == spec.priority
                && m.ty == spec.ty
                && m.group == spec.group
                && m.mask == spec.mask
        }) {
            take_ref(&hit.refcnt, "matcher");
            return Ok(Arc::clone(hit));
        }

        let tbl = self.get_table(spec.ty, spec.group)?;
        let handle = match self.dev.create_matcher(
            tbl.handle,
            spec.priority,
            spec.criteria,
            &spec.mask.buf,
        ) {
            Ok(h) => h,
            Err(e) => {
                self.release_table(&tbl);
                return Err(e);
            }
        };

        let res = Arc::new(MatcherResource {
            crc: spec.crc,
            priority: spec.priority,
            ty: spec.ty,
            group: spec.group,
            mask: spec.mask,
            handle,
            tbl,
            refcnt: AtomicU32::new(1),
        });
        log::debug!(
            "priority {} new matcher: refcnt 1",
            res.priority
        );
        cache.insert(0, Arc::clone(&res));
        Ok(res)
    }

    pub fn release_matcher(&self, res: &Arc<MatcherResource>) {
        if drop_ref(&res.refcnt, "matcher") {
            self.dev.destroy_matcher(res.handle);
            self.matchers
                .lock()
                .unwrap()
                .retain(|r| !Arc::ptr_eq(r, res));
            self.release_table(&res.tbl);
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_sizes(&self) -> [usize; 8] {
        [
            self.encaps_decaps.lock().unwrap().len(),
            self.modify_cmds.lock().unwrap().len(),
            self.tables.lock().unwrap().len(),
            self.jump_tbls.lock().unwrap().len(),
            self.port_actions.lock().unwrap().len(),
            self.push_vlans.lock().unwrap().len(),
            self.tags.lock().unwrap().len(),
            self.matchers.lock().unwrap().len(),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::super::test_util::MockRuleDevice;
    use super::*;
    use crate::api::ErrorKind;

    #[test]
    fn encap_dedup_by_content() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev.clone());

        let a = sh
            .register_encap_decap(
                ReformatKind::Encap,
                TableType::Rx,
                false,
                vec![1, 2, 3],
            )
            .unwrap();
        let b = sh
            .register_encap_decap(
                ReformatKind::Encap,
                TableType::Rx,
                false,
                vec![1, 2, 3],
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dev.created_actions(), 1);

        // Different bytes, different resource.
        let c = sh
            .register_encap_decap(
                ReformatKind::Encap,
                TableType::Rx,
                false,
                vec![9],
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(dev.created_actions(), 2);

        sh.release_encap_decap(&a);
        sh.release_encap_decap(&b);
        assert_eq!(dev.destroyed_actions(), 1);
        sh.release_encap_decap(&c);
        assert_eq!(dev.destroyed_actions(), 2);
        assert_eq!(sh.cache_sizes()[0], 0);
    }

    #[test]
    #[should_panic(expected = "over-release")]
    fn over_release_panics() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev);

        let t = sh.register_tag(7).unwrap();
        let extra = Arc::clone(&t);
        sh.release_tag(&t);
        sh.release_tag(&extra);
    }

    #[test]
    fn n_registrations_one_object() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev.clone());

        let handles: Vec<_> = (0..5)
            .map(|_| {
                sh.register_modify_hdr(
                    TableType::Tx,
                    false,
                    vec![],
                )
            })
            .collect();
        // An empty program is a degenerate key but still dedups.
        let handles: Vec<_> =
            handles.into_iter().map(Result::unwrap).collect();
        assert_eq!(dev.created_actions(), 1);

        for h in &handles {
            sh.release_modify_hdr(h);
        }
        assert_eq!(dev.destroyed_actions(), 1);
        assert_eq!(sh.cache_sizes()[1], 0);
    }

    #[test]
    fn jump_shares_table_reference() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev.clone());

        let t1 = sh.get_table(TableType::Rx, 3).unwrap();
        let j1 = sh.register_jump(t1).unwrap();
        let t2 = sh.get_table(TableType::Rx, 3).unwrap();
        let j2 = sh.register_jump(t2).unwrap();
        assert!(Arc::ptr_eq(&j1, &j2));
        assert_eq!(sh.cache_sizes()[2], 1);

        sh.release_jump(&j1);
        sh.release_jump(&j2);
        // The jump's table went with the last reference.
        assert_eq!(sh.cache_sizes()[2], 0);
        assert_eq!(sh.cache_sizes()[3], 0);
        assert_eq!(dev.destroyed_tables(), 1);
    }

    #[test]
    fn matcher_key_includes_placement() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev);

        let spec = MatcherSpec {
            crc: 0x1234,
            priority: 2,
            ty: TableType::Rx,
            group: 0,
            criteria: 1,
            mask: MatchBuf::default(),
        };
        let a = sh.register_matcher(spec.clone()).unwrap();
        let b = sh.register_matcher(spec.clone()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = sh
            .register_matcher(MatcherSpec { priority: 3, ..spec })
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        sh.release_matcher(&a);
        sh.release_matcher(&b);
        sh.release_matcher(&c);
        assert_eq!(sh.cache_sizes()[7], 0);
    }

    #[test]
    fn device_failure_leaves_no_entry() {
        let dev = Arc::new(MockRuleDevice::default());
        dev.fail_next();
        let sh = SharedCtx::new(dev.clone());

        let err = sh.register_port_id(4).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceFailure);
        assert_eq!(sh.cache_sizes()[4], 0);
        assert_eq!(dev.destroyed_actions(), 0);

        // A later attempt succeeds cleanly.
        let p = sh.register_port_id(4).unwrap();
        sh.release_port_id(&p);
    }
}
