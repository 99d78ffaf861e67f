// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Device collaborator contracts.
//!
//! The engine never touches hardware; everything below the
//! compile/dedup logic goes through these traits. Creation calls
//! return opaque handles or a reason; destruction is infallible, and a
//! failed creation must never be paired with a destroy.

use super::Block;
use super::bitmap::PtypeBitmap;
use super::extract::FvWord;
use super::profile::ProfileId;
use super::ptype::PtypeAttr;
use crate::api::CounterQuery;
use crate::api::FlowError;
use crate::api::MAX_VSI;
use serde::Deserialize;
use serde::Serialize;

/// Hardware profile ID, assigned by the device when a profile is
/// programmed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HwProfileId(pub u8);

/// Opaque hardware action object handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ActionHandle(pub u64);

/// Opaque hardware flow-table handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TableHandle(pub u64);

/// Opaque hardware matcher handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MatcherHandle(pub u64);

/// Opaque installed-flow handle.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FlowHandle(pub u64);

/// Base hardware counter ID of a single or batch allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct CounterBaseId(pub u32);

/// Which flow-table family an object belongs to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TableType {
    Rx,
    Tx,
    /// The port-to-port switching domain.
    Transfer,
}

/// Direction of a packet-reformat action.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReformatKind {
    /// Prepend the provided header bytes.
    Encap,
    /// Strip the outer headers.
    Decap,
}

/// One header-rewrite command of a modify-header program.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModifyCmd {
    pub op: ModifyOp,
    pub field: ModifyField,
    /// Width in bits; zero means the full 32-bit word.
    pub length: u8,
    /// Right-aligned value bytes.
    pub data: [u8; 4],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModifyOp {
    Set,
    Add,
}

/// Rewritable header fields, as the hardware carves them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModifyField {
    OutDmac47_16,
    OutDmac15_0,
    OutSmac47_16,
    OutSmac15_0,
    OutFirstVid,
    OutIpv4Ttl,
    OutSipv4,
    OutDipv4,
    OutIpv6Hoplimit,
    OutSipv6_127_96,
    OutSipv6_95_64,
    OutSipv6_63_32,
    OutSipv6_31_0,
    OutDipv6_127_96,
    OutDipv6_95_64,
    OutDipv6_63_32,
    OutDipv6_31_0,
    OutUdpSport,
    OutUdpDport,
    OutTcpSport,
    OutTcpDport,
    OutTcpSeqNum,
    OutTcpAckNum,
}

/// Classifier-side device programming: profiles and VSI bindings.
pub trait ProfileDevice: Send + Sync {
    /// Program a compiled profile into the given block.
    fn add_profile(
        &self,
        blk: Block,
        id: ProfileId,
        ptypes: &PtypeBitmap,
        attrs: &[PtypeAttr],
        es: &[FvWord],
        masks: &[u16],
    ) -> Result<(), FlowError>;

    /// Tear down a previously programmed profile.
    fn remove_profile(&self, blk: Block, id: ProfileId)
        -> Result<(), FlowError>;

    /// The hardware profile ID backing a software profile, once
    /// programmed.
    fn hw_profile_id(&self, blk: Block, id: ProfileId) -> Option<HwProfileId>;

    fn add_vsi_binding(
        &self,
        blk: Block,
        hw_vsi: u16,
        id: ProfileId,
    ) -> Result<(), FlowError>;

    fn remove_vsi_binding(
        &self,
        blk: Block,
        hw_vsi: u16,
        id: ProfileId,
    ) -> Result<(), FlowError>;

    fn is_vsi_valid(&self, vsi: u16) -> bool {
        vsi < MAX_VSI
    }

    /// Map a software VSI handle to the hardware VSI number.
    fn hw_vsi_num(&self, vsi: u16) -> u16 {
        vsi
    }
}

/// A hardware register the RSS layer programs directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Register {
    /// Symmetric-hash byte-swap directives: register `index` of the
    /// per-profile set.
    Hsymm { prof: HwProfileId, index: u8 },
}

/// Raw register access, used only for symmetric-hash programming.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, reg: Register) -> u32;
    fn write32(&self, reg: Register, val: u32);
}

/// Rule-side device programming: tables, matchers, action objects,
/// flows, and counters.
pub trait RuleDevice: Send + Sync {
    fn create_flow_table(
        &self,
        ty: TableType,
        table_id: u32,
    ) -> Result<TableHandle, FlowError>;

    fn destroy_flow_table(&self, tbl: TableHandle);

    fn create_dest_table(
        &self,
        tbl: TableHandle,
    ) -> Result<ActionHandle, FlowError>;

    fn create_dest_port(&self, port: u16) -> Result<ActionHandle, FlowError>;

    fn create_modify_header(
        &self,
        ty: TableType,
        root: bool,
        cmds: &[ModifyCmd],
    ) -> Result<ActionHandle, FlowError>;

    fn create_packet_reformat(
        &self,
        kind: ReformatKind,
        ty: TableType,
        root: bool,
        data: &[u8],
    ) -> Result<ActionHandle, FlowError>;

    fn create_push_vlan(
        &self,
        ty: TableType,
        vlan_tag: u32,
    ) -> Result<ActionHandle, FlowError>;

    fn create_tag(&self, tag: u32) -> Result<ActionHandle, FlowError>;

    fn destroy_action(&self, action: ActionHandle);

    fn create_matcher(
        &self,
        tbl: TableHandle,
        priority: u16,
        criteria: u8,
        mask: &[u8],
    ) -> Result<MatcherHandle, FlowError>;

    fn destroy_matcher(&self, matcher: MatcherHandle);

    fn create_flow(
        &self,
        matcher: MatcherHandle,
        value: &[u8],
        actions: &[ActionHandle],
    ) -> Result<FlowHandle, FlowError>;

    fn destroy_flow(&self, flow: FlowHandle);

    /// Allocate hardware counters; `bulk` of zero allocates a single
    /// counter, otherwise an aligned block of `bulk` counters.
    fn alloc_counters(&self, bulk: u32) -> Result<CounterBaseId, FlowError>;

    fn free_counters(&self, base: CounterBaseId);

    fn create_counter_action(
        &self,
        base: CounterBaseId,
        offset: u16,
    ) -> Result<ActionHandle, FlowError>;

    /// Synchronous single-counter query; the fallback path when the
    /// batched refresh mechanism is unavailable.
    fn query_counter(&self, base: CounterBaseId)
        -> Result<CounterQuery, FlowError>;

    /// The switching-domain drop action.
    fn transfer_drop_action(&self) -> Result<ActionHandle, FlowError>;

    /// Acquire the drop queue's action.
    fn drop_queue_action(&self) -> Result<ActionHandle, FlowError>;

    fn release_drop_queue(&self);

    /// Get-or-create the hash RX queue action for a fate spread.
    fn hash_queue_action(
        &self,
        key: &[u8],
        hash_fields: u64,
        queues: &[u16],
        tunnel: bool,
    ) -> Result<ActionHandle, FlowError>;

    fn release_hash_queue(&self, action: ActionHandle);

    /// The device's VLAN-pop action, if the port supports one.
    fn pop_vlan_action(&self) -> Option<ActionHandle>;
}

/// Rule-side device capabilities and role, read at engine creation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleDeviceCaps {
    /// Number of priority levels; usable priorities are below
    /// `flow_prio - 1`.
    pub flow_prio: u32,
    pub max_tables: u32,
    pub max_tables_transfer: u32,
    /// Switching (transfer) rules are expressible.
    pub esw_enabled: bool,
    pub is_master: bool,
    pub is_representor: bool,
    /// The device exposes flow counters at all.
    pub counters_supported: bool,
    /// Use the unpooled per-counter query path.
    pub counter_fallback: bool,
    /// Counters can be allocated in aligned batches.
    pub bulk_counters: bool,
    /// Metadata matching is enabled on the transmit side.
    pub match_meta: bool,
    pub pop_vlan_supported: bool,
    /// This port's own switch-port number.
    pub own_port: u16,
}

impl Default for RuleDeviceCaps {
    fn default() -> Self {
        Self {
            flow_prio: 16,
            max_tables: 32,
            max_tables_transfer: 256,
            esw_enabled: false,
            is_master: true,
            is_representor: false,
            counters_supported: true,
            counter_fallback: false,
            bulk_counters: true,
            match_meta: false,
            pop_vlan_supported: true,
            own_port: 0,
        }
    }
}
