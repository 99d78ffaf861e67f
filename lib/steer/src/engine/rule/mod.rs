// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The rule engine.
//!
//! Admits pattern/action flow rules, compiles them into hardware match
//! structures and deduplicated action resources, and installs them
//! through the rule-side device contract. An upper dispatch layer
//! drives the fixed callback set of [`FlowOps`] polymorphically per
//! back-end.

pub mod counter;
pub mod flags;
pub mod match_buf;
pub mod modify;
pub mod resource;
pub mod translate;
pub mod validate;

use super::device::ActionHandle;
use super::device::FlowHandle;
use super::device::RuleDevice;
use super::device::RuleDeviceCaps;
use counter::CounterHandle;
use flags::ActionFlags;
use flags::ItemFlags;
use match_buf::MatchBuf;
use resource::EncapDecapResource;
use resource::JumpTblResource;
use resource::MatcherResource;
use resource::ModifyHdrResource;
use resource::PortIdResource;
use resource::PushVlanResource;
use resource::SharedCtx;
use resource::TagResource;
use crate::api::CounterQuery;
use crate::api::ErrorCause;
use crate::api::ErrorKind;
use crate::api::RSS_HASH_KEY_LEN;
use crate::api::RuleAction;
use crate::api::RuleAttr;
use crate::api::RuleError;
use crate::api::RuleItem;
use std::sync::Arc;

/// The default Toeplitz hash key, used when a rule's RSS action does
/// not supply one.
pub const DEFAULT_RSS_KEY: [u8; RSS_HASH_KEY_LEN] = [
    0x2c, 0xc6, 0x81, 0xd1, 0x5b, 0xdb, 0xf4, 0xf7, 0xfc, 0xa2, 0x83, 0x19,
    0xdb, 0x1a, 0x3e, 0x94, 0x6b, 0x9e, 0x38, 0xd9, 0x2c, 0x9c, 0x03, 0xd1,
    0xad, 0x99, 0x44, 0xa7, 0xd9, 0x56, 0x3d, 0x59, 0x06, 0x3c, 0x25, 0xf3,
    0xfc, 0x1f, 0xdc, 0x2a,
];

/// The device-level state of one compiled rule.
#[derive(Default)]
pub struct DevFlow {
    pub matcher: Option<Arc<MatcherResource>>,
    pub encap_decap: Option<Arc<EncapDecapResource>>,
    pub modify_hdr: Option<Arc<ModifyHdrResource>>,
    pub jump: Option<Arc<JumpTblResource>>,
    pub port_id_action: Option<Arc<PortIdResource>>,
    pub push_vlan: Option<Arc<PushVlanResource>>,
    /// Ordered hardware action handles.
    pub actions: Vec<ActionHandle>,
    /// The value half of the match descriptor; the mask half lives in
    /// the matcher.
    pub value: MatchBuf,
    pub hash_fields: u64,
    pub layers: ItemFlags,
    /// Fate queue action acquired at apply time.
    hrxq: Option<ActionHandle>,
    drop_queue: bool,
    hw_flow: Option<FlowHandle>,
}

/// One flow rule through its compile/install lifecycle. Safe to
/// destroy at any stage; released fields reset to an empty state.
pub struct Flow {
    pub group: u32,
    pub transfer: bool,
    pub egress: bool,
    pub actions: ActionFlags,
    pub counter: Option<CounterHandle>,
    pub tag: Option<Arc<TagResource>>,
    pub queues: Vec<u16>,
    pub rss_types: u64,
    pub rss_level: u32,
    pub rss_key: [u8; RSS_HASH_KEY_LEN],
    pub dev_flows: Vec<DevFlow>,
}

impl Flow {
    fn new() -> Self {
        Self {
            group: 0,
            transfer: false,
            egress: false,
            actions: ActionFlags::empty(),
            counter: None,
            tag: None,
            queues: Vec::new(),
            rss_types: 0,
            rss_level: 0,
            rss_key: DEFAULT_RSS_KEY,
            dev_flows: vec![DevFlow::default()],
        }
    }
}

/// The fixed callback interface an upper dispatch layer invokes per
/// back-end.
pub trait FlowOps {
    /// Admit or reject a rule with no side effects.
    fn validate(
        &self,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Result<(), RuleError>;

    /// Allocate the flow object a later translate fills in.
    fn prepare(
        &self,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Result<Flow, RuleError>;

    /// Compile the rule into hardware match bytes and action handles.
    fn translate(
        &self,
        flow: &mut Flow,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Result<(), RuleError>;

    /// Install the compiled rule into the device.
    fn apply(&self, flow: &mut Flow) -> Result<(), RuleError>;

    /// Remove the rule from the device but keep its compiled state.
    fn remove(&self, flow: &mut Flow);

    /// Remove the rule and release every resource it references.
    fn destroy(&self, flow: Flow);

    /// Read the rule's counter.
    fn query(&self, flow: &Flow, reset: bool)
        -> Result<CounterQuery, RuleError>;
}

/// A per-port rule engine over one shared device context.
pub struct RuleEngine {
    dev: Arc<dyn RuleDevice>,
    caps: RuleDeviceCaps,
    sh: Arc<SharedCtx>,
}

impl RuleEngine {
    pub fn new(caps: RuleDeviceCaps, sh: Arc<SharedCtx>) -> Self {
        sh.attach_port();
        Self { dev: Arc::clone(sh.dev()), caps, sh }
    }

    pub fn shared(&self) -> &Arc<SharedCtx> {
        &self.sh
    }

    pub fn caps(&self) -> &RuleDeviceCaps {
        &self.caps
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        self.sh.detach_port();
    }
}

/// Release everything a partially or fully compiled flow holds, in
/// reverse-acquisition order, through the normal release paths so
/// shared reference counts stay correct.
fn release_flow_resources(
    sh: &SharedCtx,
    dev: &Arc<dyn RuleDevice>,
    flow: &mut Flow,
) {
    for df in flow.dev_flows.iter_mut() {
        if let Some(m) = df.matcher.take() {
            sh.release_matcher(&m);
        }
        if let Some(p) = df.push_vlan.take() {
            sh.release_push_vlan(&p);
        }
        if let Some(p) = df.port_id_action.take() {
            sh.release_port_id(&p);
        }
        if let Some(j) = df.jump.take() {
            sh.release_jump(&j);
        }
        if let Some(m) = df.modify_hdr.take() {
            sh.release_modify_hdr(&m);
        }
        if let Some(e) = df.encap_decap.take() {
            sh.release_encap_decap(&e);
        }
        df.actions.clear();
    }
    if let Some(t) = flow.tag.take() {
        sh.release_tag(&t);
    }
    if let Some(c) = flow.counter.take() {
        sh.counters.release(dev, &c);
    }
}

impl RuleEngine {
    fn apply_sync(&self, flow: &mut Flow) -> Result<(), RuleError> {
        let result = (|| {
            for i in 0..flow.dev_flows.len() {
                let mut actions = flow.dev_flows[i].actions.clone();
                debug_assert!(
                    !actions.contains(&translate::ACTION_PLACEHOLDER)
                );

                if flow.actions.contains(ActionFlags::DROP) {
                    if flow.transfer {
                        actions.push(self.dev.transfer_drop_action()?);
                    } else {
                        let h = self.dev.drop_queue_action()?;
                        flow.dev_flows[i].drop_queue = true;
                        flow.dev_flows[i].hrxq = Some(h);
                        actions.push(h);
                    }
                } else if flow
                    .actions
                    .intersects(ActionFlags::QUEUE | ActionFlags::RSS)
                {
                    let tunnel = flow.dev_flows[i]
                        .layers
                        .intersects(ItemFlags::TUNNEL);
                    let h = self.dev.hash_queue_action(
                        &flow.rss_key,
                        flow.dev_flows[i].hash_fields,
                        &flow.queues,
                        tunnel,
                    )?;
                    flow.dev_flows[i].hrxq = Some(h);
                    actions.push(h);
                }

                let df = &mut flow.dev_flows[i];
                let matcher =
                    df.matcher.as_ref().expect("apply before translate");
                df.hw_flow = Some(self.dev.create_flow(
                    matcher.handle,
                    &df.value.buf,
                    &actions,
                )?);
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Unwind the fate queues acquired for this attempt; the
            // compiled state stays for a retry or destroy.
            for df in flow.dev_flows.iter_mut() {
                if let Some(h) = df.hrxq.take() {
                    if df.drop_queue {
                        self.dev.release_drop_queue();
                        df.drop_queue = false;
                    } else {
                        self.dev.release_hash_queue(h);
                    }
                }
            }
            let e: crate::api::FlowError = e;
            return Err(RuleError::new(
                e.kind,
                ErrorCause::Unspecified,
                e.reason,
            ));
        }

        Ok(())
    }

    fn remove_sync(&self, flow: &mut Flow) {
        for df in flow.dev_flows.iter_mut() {
            if let Some(h) = df.hw_flow.take() {
                self.dev.destroy_flow(h);
            }
            if let Some(h) = df.hrxq.take() {
                if df.drop_queue {
                    self.dev.release_drop_queue();
                    df.drop_queue = false;
                } else {
                    self.dev.release_hash_queue(h);
                }
            }
        }
    }
}

impl FlowOps for RuleEngine {
    fn validate(
        &self,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Result<(), RuleError> {
        validate::validate(&self.caps, attr, items, actions)
    }

    fn prepare(
        &self,
        _attr: &RuleAttr,
        _items: &[RuleItem],
        _actions: &[RuleAction],
    ) -> Result<Flow, RuleError> {
        Ok(Flow::new())
    }

    fn translate(
        &self,
        flow: &mut Flow,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Result<(), RuleError> {
        let _guard = self.sh.shared_lock();
        translate::translate(
            &self.sh, &self.dev, &self.caps, flow, attr, items, actions,
        )
    }

    fn apply(&self, flow: &mut Flow) -> Result<(), RuleError> {
        let _guard = self.sh.shared_lock();
        self.apply_sync(flow)
    }

    fn remove(&self, flow: &mut Flow) {
        let _guard = self.sh.shared_lock();
        self.remove_sync(flow);
    }

    fn destroy(&self, mut flow: Flow) {
        let _guard = self.sh.shared_lock();
        self.remove_sync(&mut flow);
        release_flow_resources(&self.sh, &self.dev, &mut flow);
    }

    fn query(
        &self,
        flow: &Flow,
        reset: bool,
    ) -> Result<CounterQuery, RuleError> {
        match &flow.counter {
            Some(c) => {
                self.sh.counters.query(&self.dev, c, reset).map_err(|e| {
                    RuleError::new(e.kind, ErrorCause::Unspecified, e.reason)
                })
            }
            None => Err(RuleError::new(
                ErrorKind::InvalidArgument,
                ErrorCause::Unspecified,
                "counters are not available for this rule",
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::super::device::ActionHandle;
    use super::super::device::CounterBaseId;
    use super::super::device::FlowHandle;
    use super::super::device::MatcherHandle;
    use super::super::device::ModifyCmd;
    use super::super::device::ReformatKind;
    use super::super::device::RuleDevice;
    use super::super::device::TableHandle;
    use super::super::device::TableType;
    use crate::api::CounterQuery;
    use crate::api::FlowError;
    use core::sync::atomic::AtomicBool;
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::AtomicU64;
    use core::sync::atomic::Ordering;

    /// Rule device tallying creations and destructions, with one-shot
    /// failure injection.
    #[derive(Default)]
    pub struct MockRuleDevice {
        next_handle: AtomicU64,
        next_counter: AtomicU32,
        created_actions: AtomicU32,
        destroyed_actions: AtomicU32,
        created_tables: AtomicU32,
        destroyed_tables: AtomicU32,
        created_matchers: AtomicU32,
        destroyed_matchers: AtomicU32,
        created_flows: AtomicU32,
        destroyed_flows: AtomicU32,
        hrxq_refs: AtomicU32,
        fail_next: AtomicBool,
        pub fail_flows: AtomicBool,
    }

    impl MockRuleDevice {
        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::Release);
        }

        fn check_fail(&self) -> Result<(), FlowError> {
            if self.fail_next.swap(false, Ordering::AcqRel) {
                return Err(FlowError::device("injected failure"));
            }
            Ok(())
        }

        fn handle(&self) -> u64 {
            self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
        }

        fn action(&self) -> Result<ActionHandle, FlowError> {
            self.check_fail()?;
            self.created_actions.fetch_add(1, Ordering::Relaxed);
            Ok(ActionHandle(self.handle()))
        }

        pub fn created_actions(&self) -> u32 {
            self.created_actions.load(Ordering::Relaxed)
        }

        pub fn destroyed_actions(&self) -> u32 {
            self.destroyed_actions.load(Ordering::Relaxed)
        }

        pub fn destroyed_tables(&self) -> u32 {
            self.destroyed_tables.load(Ordering::Relaxed)
        }

        pub fn created_matchers(&self) -> u32 {
            self.created_matchers.load(Ordering::Relaxed)
        }

        pub fn live_flows(&self) -> u32 {
            self.created_flows.load(Ordering::Relaxed)
                - self.destroyed_flows.load(Ordering::Relaxed)
        }

        pub fn hrxq_refs(&self) -> u32 {
            self.hrxq_refs.load(Ordering::Relaxed)
        }
    }

    impl RuleDevice for MockRuleDevice {
        fn create_flow_table(
            &self,
            _ty: TableType,
            _table_id: u32,
        ) -> Result<TableHandle, FlowError> {
            self.check_fail()?;
            self.created_tables.fetch_add(1, Ordering::Relaxed);
            Ok(TableHandle(self.handle()))
        }

        fn destroy_flow_table(&self, _tbl: TableHandle) {
            self.destroyed_tables.fetch_add(1, Ordering::Relaxed);
        }

        fn create_dest_table(
            &self,
            _tbl: TableHandle,
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn create_dest_port(
            &self,
            _port: u16,
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn create_modify_header(
            &self,
            _ty: TableType,
            _root: bool,
            _cmds: &[ModifyCmd],
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn create_packet_reformat(
            &self,
            _kind: ReformatKind,
            _ty: TableType,
            _root: bool,
            _data: &[u8],
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn create_push_vlan(
            &self,
            _ty: TableType,
            _vlan_tag: u32,
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn create_tag(&self, _tag: u32) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn destroy_action(&self, _action: ActionHandle) {
            self.destroyed_actions.fetch_add(1, Ordering::Relaxed);
        }

        fn create_matcher(
            &self,
            _tbl: TableHandle,
            _priority: u16,
            _criteria: u8,
            _mask: &[u8],
        ) -> Result<MatcherHandle, FlowError> {
            self.check_fail()?;
            self.created_matchers.fetch_add(1, Ordering::Relaxed);
            Ok(MatcherHandle(self.handle()))
        }

        fn destroy_matcher(&self, _matcher: MatcherHandle) {
            self.destroyed_matchers.fetch_add(1, Ordering::Relaxed);
        }

        fn create_flow(
            &self,
            _matcher: MatcherHandle,
            _value: &[u8],
            _actions: &[ActionHandle],
        ) -> Result<FlowHandle, FlowError> {
            self.check_fail()?;
            if self.fail_flows.load(Ordering::Acquire) {
                return Err(FlowError::device(
                    "hardware refuses to create flow",
                ));
            }
            self.created_flows.fetch_add(1, Ordering::Relaxed);
            Ok(FlowHandle(self.handle()))
        }

        fn destroy_flow(&self, _flow: FlowHandle) {
            self.destroyed_flows.fetch_add(1, Ordering::Relaxed);
        }

        fn alloc_counters(
            &self,
            bulk: u32,
        ) -> Result<CounterBaseId, FlowError> {
            self.check_fail()?;
            let n = if bulk == 0 { 1 } else { bulk };
            let base = self.next_counter.fetch_add(n, Ordering::Relaxed);
            // Batch allocations come back range-aligned.
            if bulk != 0 {
                let aligned = base.next_multiple_of(bulk);
                self.next_counter
                    .store(aligned + bulk, Ordering::Relaxed);
                return Ok(CounterBaseId(aligned));
            }
            Ok(CounterBaseId(base))
        }

        fn free_counters(&self, _base: CounterBaseId) {}

        fn create_counter_action(
            &self,
            _base: CounterBaseId,
            _offset: u16,
        ) -> Result<ActionHandle, FlowError> {
            self.action()
        }

        fn query_counter(
            &self,
            _base: CounterBaseId,
        ) -> Result<CounterQuery, FlowError> {
            Ok(CounterQuery { hits: 1, bytes: 64 })
        }

        fn transfer_drop_action(&self) -> Result<ActionHandle, FlowError> {
            Ok(ActionHandle(0xd0d0))
        }

        fn drop_queue_action(&self) -> Result<ActionHandle, FlowError> {
            self.hrxq_refs.fetch_add(1, Ordering::Relaxed);
            Ok(ActionHandle(0xdd00))
        }

        fn release_drop_queue(&self) {
            self.hrxq_refs.fetch_sub(1, Ordering::Relaxed);
        }

        fn hash_queue_action(
            &self,
            _key: &[u8],
            _hash_fields: u64,
            _queues: &[u16],
            _tunnel: bool,
        ) -> Result<ActionHandle, FlowError> {
            self.check_fail()?;
            self.hrxq_refs.fetch_add(1, Ordering::Relaxed);
            Ok(ActionHandle(self.handle()))
        }

        fn release_hash_queue(&self, _action: ActionHandle) {
            self.hrxq_refs.fetch_sub(1, Ordering::Relaxed);
        }

        fn pop_vlan_action(&self) -> Option<ActionHandle> {
            Some(ActionHandle(0xb0b0))
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_util::MockRuleDevice;
    use super::*;
    use crate::api::EthHdr;
    use crate::api::Ipv4Hdr;
    use crate::api::RssSpec;
    use crate::api::UdpHdr;
    use core::sync::atomic::Ordering;

    fn engine() -> (Arc<MockRuleDevice>, RuleEngine) {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev.clone());
        (dev, RuleEngine::new(RuleDeviceCaps::default(), sh))
    }

    fn ingress() -> RuleAttr {
        RuleAttr { ingress: true, ..Default::default() }
    }

    fn eth_ipv4_udp() -> Vec<RuleItem> {
        vec![
            RuleItem::Eth { spec: EthHdr::default(), mask: None },
            RuleItem::Ipv4 {
                spec: Ipv4Hdr {
                    src: 0x0a00_0001,
                    dst: 0x0a00_0002,
                    ..Default::default()
                },
                mask: Some(Ipv4Hdr {
                    src: u32::MAX,
                    dst: u32::MAX,
                    ..Default::default()
                }),
            },
            RuleItem::Udp {
                spec: UdpHdr { dst_port: 4789, ..Default::default() },
                mask: Some(UdpHdr { dst_port: 0xffff, ..Default::default() }),
            },
        ]
    }

    fn install(
        eng: &RuleEngine,
        attr: &RuleAttr,
        items: &[RuleItem],
        actions: &[RuleAction],
    ) -> Flow {
        eng.validate(attr, items, actions).unwrap();
        let mut flow = eng.prepare(attr, items, actions).unwrap();
        eng.translate(&mut flow, attr, items, actions).unwrap();
        eng.apply(&mut flow).unwrap();
        flow
    }

    #[test]
    fn full_lifecycle() {
        let (dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![
            RuleAction::Count { shared: false, id: 0 },
            RuleAction::Queue { index: 3 },
        ];

        let flow = install(&eng, &attr, &items, &actions);
        assert_eq!(dev.live_flows(), 1);
        assert_eq!(dev.hrxq_refs(), 1);

        // The counter query sees the device baseline delta.
        let q = eng.query(&flow, false).unwrap();
        assert_eq!(q, CounterQuery::default());

        eng.destroy(flow);
        assert_eq!(dev.live_flows(), 0);
        assert_eq!(dev.hrxq_refs(), 0);
        assert_eq!(eng.shared().cache_sizes(), [0; 8]);
    }

    #[test]
    fn modify_actions_fold_into_one_program() {
        let (dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![
            RuleAction::SetIpv4Src(0x0102_0304),
            RuleAction::SetIpv4Dst(0x0506_0708),
            RuleAction::SetTpDst(53),
            RuleAction::Queue { index: 0 },
        ];

        let flow = install(&eng, &attr, &items, &actions);
        let df = &flow.dev_flows[0];
        let res = df.modify_hdr.as_ref().unwrap();
        assert_eq!(res.cmds.len(), 3);
        // The program occupies the position of the first rewrite
        // action.
        assert_eq!(df.actions.len(), 1);
        assert_eq!(df.actions[0], res.action);

        // A second rule with the same rewrites shares the program.
        let flow2 = install(&eng, &attr, &items, &actions);
        assert!(Arc::ptr_eq(
            flow.dev_flows[0].modify_hdr.as_ref().unwrap(),
            flow2.dev_flows[0].modify_hdr.as_ref().unwrap()
        ));
        // Matcher dedup kicks in as well.
        assert_eq!(dev.created_matchers(), 1);

        let modify_actions = dev.created_actions();
        eng.destroy(flow);
        eng.destroy(flow2);
        // One modify-header object existed and died exactly once.
        assert_eq!(dev.destroyed_actions(), modify_actions);
        assert_eq!(eng.shared().cache_sizes(), [0; 8]);
    }

    #[test]
    fn validator_rejects_before_any_side_effect() {
        let (dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        // Two fate actions.
        let actions =
            vec![RuleAction::Drop, RuleAction::Queue { index: 1 }];

        let err = eng.validate(&attr, &items, &actions).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.cause, ErrorCause::Action(1));
        assert_eq!(dev.created_actions(), 0);
        assert_eq!(dev.created_matchers(), 0);
        assert_eq!(eng.shared().cache_sizes(), [0; 8]);
    }

    #[test]
    fn translate_failure_unwinds_resources() {
        let (dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![
            RuleAction::Count { shared: false, id: 0 },
            RuleAction::Queue { index: 1 },
        ];

        // First rule pins a counter and a matcher.
        let flow1 = install(&eng, &attr, &items, &actions);
        let caches_before = eng.shared().cache_sizes();

        // The second rule fails late, at matcher creation; its
        // counter reference must be released again.
        let mut flow2 = eng.prepare(&attr, &items, &actions).unwrap();
        dev.fail_next();
        let err = eng
            .translate(&mut flow2, &attr, &items, &actions)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceFailure);
        assert!(flow2.counter.is_none());
        assert!(flow2.dev_flows[0].matcher.is_none());
        assert_eq!(eng.shared().cache_sizes(), caches_before);

        // Destroying the failed flow again is safe.
        eng.destroy(flow2);
        eng.destroy(flow1);
        assert_eq!(eng.shared().cache_sizes(), [0; 8]);
    }

    #[test]
    fn apply_failure_releases_fate_queue() {
        let (dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![RuleAction::Rss(RssSpec {
            queues: vec![0, 1, 2, 3],
            types: 0,
            level: 0,
            key: None,
        })];

        eng.validate(&attr, &items, &actions).unwrap();
        let mut flow = eng.prepare(&attr, &items, &actions).unwrap();
        eng.translate(&mut flow, &attr, &items, &actions).unwrap();

        dev.fail_flows.store(true, Ordering::Release);
        let err = eng.apply(&mut flow).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceFailure);
        assert_eq!(dev.hrxq_refs(), 0);

        // The compiled state survives for a retry.
        dev.fail_flows.store(false, Ordering::Release);
        eng.apply(&mut flow).unwrap();
        assert_eq!(dev.live_flows(), 1);
        eng.destroy(flow);
        assert_eq!(dev.live_flows(), 0);
        assert_eq!(dev.hrxq_refs(), 0);
    }

    #[test]
    fn rss_rule_carries_hash_fields() {
        let (_dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![RuleAction::Rss(RssSpec {
            queues: vec![0, 1],
            types: crate::api::rss_types::IPV4 | crate::api::rss_types::UDP,
            level: 0,
            key: None,
        })];

        let flow = install(&eng, &attr, &items, &actions);
        let hf = flow.dev_flows[0].hash_fields;
        use translate::hash_fields as h;
        assert_eq!(
            hf,
            h::SRC_IPV4 | h::DST_IPV4 | h::SRC_PORT_UDP | h::DST_PORT_UDP
        );
        eng.destroy(flow);
    }

    #[test]
    fn jump_rule_builds_table_chain() {
        let (_dev, eng) = engine();
        let attr = ingress();
        let items = eth_ipv4_udp();
        let actions = vec![RuleAction::Jump { group: 4 }];

        let flow = install(&eng, &attr, &items, &actions);
        assert!(flow.dev_flows[0].jump.is_some());
        // Two tables: the rule's own (group 0) and the jump target.
        assert_eq!(eng.shared().cache_sizes()[2], 2);

        eng.destroy(flow);
        assert_eq!(eng.shared().cache_sizes(), [0; 8]);
    }

    #[test]
    fn decap_then_encap_fuses() {
        let (dev, eng) = engine();
        let attr = RuleAttr { egress: true, ..Default::default() };
        let items = eth_ipv4_udp();
        let actions = vec![
            RuleAction::RawDecap,
            RuleAction::RawEncap { data: vec![0xaa; 18] },
        ];

        let flow = install(&eng, &attr, &items, &actions);
        // One reformat action covers the decap+encap pair.
        let df = &flow.dev_flows[0];
        assert_eq!(df.actions.len(), 1);
        let enc = df.encap_decap.as_ref().unwrap();
        assert_eq!(enc.buf, vec![0xaa; 18]);
        assert_eq!(dev.created_actions(), 1);
        eng.destroy(flow);
    }

    #[test]
    fn push_vlan_inherits_match_tci() {
        let (_dev, eng) = engine();
        let attr = RuleAttr { egress: true, ..Default::default() };
        let items = vec![
            RuleItem::Eth { spec: EthHdr::default(), mask: None },
            RuleItem::Vlan {
                spec: crate::api::VlanHdr { tci: 0x2005, inner_type: 0 },
                mask: Some(crate::api::VlanHdr {
                    tci: 0xffff,
                    inner_type: 0,
                }),
            },
        ];
        let actions = vec![
            RuleAction::SetVlanVid { vid: 0x0123 },
            RuleAction::PushVlan { ether_type: 0x8100 },
        ];

        let flow = install(&eng, &attr, &items, &actions);
        let pv = flow.dev_flows[0].push_vlan.as_ref().unwrap();
        // PCP inherited from the match, VID overridden by the set.
        assert_eq!(pv.vlan_tag, 0x8100_0000 | 0x2123);
        eng.destroy(flow);
    }

    #[test]
    fn shared_context_locks_only_when_shared() {
        let dev = Arc::new(MockRuleDevice::default());
        let sh = SharedCtx::new(dev);
        let eng1 = RuleEngine::new(RuleDeviceCaps::default(), sh.clone());
        assert!(sh.shared_lock().is_none());

        let eng2 = RuleEngine::new(RuleDeviceCaps::default(), sh.clone());
        assert!(sh.shared_lock().is_some());

        drop(eng2);
        assert!(sh.shared_lock().is_none());
        drop(eng1);
    }
}
