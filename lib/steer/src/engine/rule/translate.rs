// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rule compilation.
//!
//! Two passes over an admitted rule: the action pass appends hardware
//! action handles into the device flow's ordered list (accumulating
//! all header rewrites into one pending program, flushed when the list
//! ends), and the item pass writes match/mask bytes into the parallel
//! match structures. Any failure after resources were acquired
//! releases them again, in reverse order, through their normal release
//! paths.

use super::super::device::ActionHandle;
use super::super::device::ReformatKind;
use super::super::device::RuleDevice;
use super::super::device::RuleDeviceCaps;
use super::super::device::TableType;
use super::Flow;
use super::flags::ActionFlags;
use super::flags::ItemFlags;
use super::match_buf::MatchBuf;
use super::match_buf::matcher_enable;
use super::match_buf::off;
use super::match_buf::spec_within_mask;
use super::modify;
use super::modify::ModifyHdrSpec;
use super::resource::MatcherSpec;
use super::resource::SharedCtx;
use super::validate::group_to_table;
use crate::api::ErrorCause;
use crate::api::ErrorKind;
use crate::api::EthHdr;
use crate::api::GreHdr;
use crate::api::IcmpHdr;
use crate::api::Ipv4Hdr;
use crate::api::Ipv6Hdr;
use crate::api::PRIORITY_ANY;
use crate::api::RuleAction;
use crate::api::RuleAttr;
use crate::api::RuleError;
use crate::api::RuleItem;
use crate::api::TcpHdr;
use crate::api::UdpHdr;
use crate::api::VlanHdr;
use crate::api::VxlanHdr;
use crate::api::rss_types;
use std::sync::Arc;

/// Slot value standing in for the combined modify-header action until
/// the action list terminates.
pub(super) const ACTION_PLACEHOLDER: ActionHandle = ActionHandle(u64::MAX);

/// Mark value used by the FLAG action.
pub(super) const FLOW_MARK_DEFAULT: u32 = 0x00ff_ffff;

/// The ceiling on encapsulation-header bytes.
const ENCAP_MAX_LEN: usize = 132;

/// Sub-priorities folded under each user priority, most specific
/// match first.
const PRIORITY_MAP_L2: u16 = 2;
const PRIORITY_MAP_L3: u16 = 1;
const PRIORITY_MAP_L4: u16 = 0;
const PRIORITY_SUB_LEVELS: u16 = 3;

/// Receive hash-field selector bits handed to the queue layer.
pub mod hash_fields {
    pub const SRC_IPV4: u64 = 1 << 0;
    pub const DST_IPV4: u64 = 1 << 1;
    pub const SRC_IPV6: u64 = 1 << 2;
    pub const DST_IPV6: u64 = 1 << 3;
    pub const SRC_PORT_TCP: u64 = 1 << 4;
    pub const DST_PORT_TCP: u64 = 1 << 5;
    pub const SRC_PORT_UDP: u64 = 1 << 6;
    pub const DST_PORT_UDP: u64 = 1 << 7;
}

/// Header families the pattern matches, consulted by modify actions
/// that must pick a protocol table.
#[derive(Clone, Copy, Debug, Default)]
struct PatternAttrs {
    ipv4: bool,
    ipv6: bool,
    tcp: bool,
}

impl PatternAttrs {
    fn init(items: &[RuleItem]) -> Self {
        let mut attr = Self::default();
        for item in items {
            match item {
                RuleItem::Ipv4 { .. } => attr.ipv4 = true,
                RuleItem::Ipv6 { .. } => attr.ipv6 = true,
                RuleItem::Tcp { .. } => attr.tcp = true,
                _ => {}
            }
        }
        attr
    }
}

/// Mark values are offset by one on the wire so an unmarked packet
/// reads as zero.
fn mark_to_tag(mark: u32) -> u32 {
    mark + 1
}

/// Seed push-VLAN header fields from the rule's own VLAN match, if it
/// has one. Only fully-masked components are inherited.
fn vlan_from_items(items: &[RuleItem]) -> VlanHdr {
    let mut out = VlanHdr::default();
    for item in items {
        if let RuleItem::Vlan { spec, mask } = item {
            let m = mask.unwrap_or(VlanHdr::FULL_MASK);
            if m.tci & 0xe000 == 0xe000 {
                out.tci = (out.tci & !0xe000) | (spec.tci & 0xe000);
            }
            if m.tci & 0x0fff == 0x0fff {
                out.tci = (out.tci & !0x0fff) | (spec.tci & 0x0fff);
            }
            if m.inner_type == 0xffff {
                out.inner_type = spec.inner_type;
            }
            break;
        }
    }
    out
}

/// Build the encapsulation header bytes described by a pattern-item
/// list (eth [vlan] ipv4/ipv6 udp vxlan).
pub(super) fn build_encap(items: &[RuleItem]) -> Result<Vec<u8>, RuleError> {
    let mut buf: Vec<u8> = Vec::with_capacity(ENCAP_MAX_LEN);
    let mut udp_csum_at = None;

    for (n, item) in items.iter().enumerate() {
        match item {
            RuleItem::Eth { spec, .. } => {
                buf.extend_from_slice(&spec.dst);
                buf.extend_from_slice(&spec.src);
                let et = if spec.ether_type != 0 {
                    spec.ether_type
                } else {
                    match items.get(n + 1) {
                        Some(RuleItem::Vlan { .. }) => 0x8100,
                        Some(RuleItem::Ipv6 { .. }) => 0x86dd,
                        _ => 0x0800,
                    }
                };
                buf.extend_from_slice(&et.to_be_bytes());
            }
            RuleItem::Vlan { spec, .. } => {
                buf.extend_from_slice(&spec.tci.to_be_bytes());
                let et = if spec.inner_type != 0 {
                    spec.inner_type
                } else if matches!(items.get(n + 1), Some(RuleItem::Ipv6 { .. }))
                {
                    0x86dd
                } else {
                    0x0800
                };
                buf.extend_from_slice(&et.to_be_bytes());
            }
            RuleItem::Ipv4 { spec, .. } => {
                buf.push(0x45);
                buf.push(spec.dscp << 2);
                buf.extend_from_slice(&[0, 0]); // total length
                buf.extend_from_slice(&[0, 0, 0, 0]); // id + fragment
                buf.push(if spec.ttl != 0 { spec.ttl } else { 64 });
                buf.push(if spec.proto != 0 { spec.proto } else { 17 });
                buf.extend_from_slice(&[0, 0]); // checksum
                buf.extend_from_slice(&spec.src.to_be_bytes());
                buf.extend_from_slice(&spec.dst.to_be_bytes());
            }
            RuleItem::Ipv6 { spec, .. } => {
                buf.extend_from_slice(&[0x60, 0, 0, 0]);
                buf.extend_from_slice(&[0, 0]); // payload length
                buf.push(if spec.proto != 0 { spec.proto } else { 17 });
                buf.push(64);
                buf.extend_from_slice(&spec.src);
                buf.extend_from_slice(&spec.dst);
            }
            RuleItem::Udp { spec, .. } => {
                buf.extend_from_slice(&spec.src_port.to_be_bytes());
                buf.extend_from_slice(&spec.dst_port.to_be_bytes());
                buf.extend_from_slice(&[0, 0]); // length
                udp_csum_at = Some(buf.len());
                buf.extend_from_slice(&[0, 0]);
            }
            RuleItem::Vxlan { spec, .. } => {
                buf.push(0x08); // VNI-valid flag
                buf.extend_from_slice(&[0, 0, 0]);
                buf.extend_from_slice(&(spec.vni << 8).to_be_bytes());
            }
            other => {
                return Err(RuleError::new(
                    ErrorKind::InvalidArgument,
                    ErrorCause::Unspecified,
                    format!("{} cannot appear in an encap header", other.name()),
                ));
            }
        }

        if buf.len() > ENCAP_MAX_LEN {
            return Err(RuleError::new(
                ErrorKind::ResourceExhausted,
                ErrorCause::Unspecified,
                "encapsulation header too long",
            ));
        }
    }

    // A tunnel UDP header must not carry a checksum the hardware will
    // not maintain.
    if let Some(at) = udp_csum_at {
        buf[at] = 0;
        buf[at + 1] = 0;
    }

    Ok(buf)
}

fn set_masked_bytes(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    at: usize,
    spec: &[u8],
    mask: &[u8],
) {
    matcher.set_bytes(at, mask);
    let mixed: Vec<u8> =
        spec.iter().zip(mask.iter()).map(|(s, m)| s & m).collect();
    key.set_bytes(at, &mixed);
}

fn item_eth(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &EthHdr,
    mask: &EthHdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    set_masked_bytes(matcher, key, base + off::DMAC, &spec.dst, &mask.dst);
    set_masked_bytes(matcher, key, base + off::SMAC, &spec.src, &mask.src);
    matcher.set_u16(base + off::ETHERTYPE, mask.ether_type);
    key.set_u16(base + off::ETHERTYPE, spec.ether_type & mask.ether_type);
}

fn item_vlan(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &VlanHdr,
    mask: &VlanHdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    matcher.set_u16(base + off::VLAN_TCI, mask.tci);
    key.set_u16(base + off::VLAN_TCI, spec.tci & mask.tci);
    matcher.set_u8(base + off::VLAN_PRESENT, 0xff);
    key.set_u8(base + off::VLAN_PRESENT, 1);
    if mask.inner_type != 0 {
        matcher.set_u16(base + off::ETHERTYPE, mask.inner_type);
        key.set_u16(base + off::ETHERTYPE, spec.inner_type & mask.inner_type);
    }
}

fn item_ipv4(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &Ipv4Hdr,
    mask: &Ipv4Hdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    // IPv4 addresses ride the tail of the 16-byte address slots.
    matcher.set_u32(base + off::SRC_IP + 12, mask.src);
    key.set_u32(base + off::SRC_IP + 12, spec.src & mask.src);
    matcher.set_u32(base + off::DST_IP + 12, mask.dst);
    key.set_u32(base + off::DST_IP + 12, spec.dst & mask.dst);
    matcher.set_u8(base + off::IP_PROTO, mask.proto);
    key.set_u8(base + off::IP_PROTO, spec.proto & mask.proto);
    matcher.set_u8(base + off::IP_DSCP, mask.dscp);
    key.set_u8(base + off::IP_DSCP, spec.dscp & mask.dscp);
    matcher.set_u8(base + off::IP_TTL, mask.ttl);
    key.set_u8(base + off::IP_TTL, spec.ttl & mask.ttl);
}

fn item_ipv6(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &Ipv6Hdr,
    mask: &Ipv6Hdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    set_masked_bytes(matcher, key, base + off::SRC_IP, &spec.src, &mask.src);
    set_masked_bytes(matcher, key, base + off::DST_IP, &spec.dst, &mask.dst);
    matcher.set_u8(base + off::IP_PROTO, mask.proto);
    key.set_u8(base + off::IP_PROTO, spec.proto & mask.proto);
}

fn item_tcp(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &TcpHdr,
    mask: &TcpHdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    matcher.set_u8(base + off::IP_PROTO, 0xff);
    key.set_u8(base + off::IP_PROTO, 6);
    matcher.set_u16(base + off::L4_SPORT, mask.src_port);
    key.set_u16(base + off::L4_SPORT, spec.src_port & mask.src_port);
    matcher.set_u16(base + off::L4_DPORT, mask.dst_port);
    key.set_u16(base + off::L4_DPORT, spec.dst_port & mask.dst_port);
    matcher.set_u8(base + off::TCP_FLAGS, mask.flags);
    key.set_u8(base + off::TCP_FLAGS, spec.flags & mask.flags);
}

fn item_udp(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &UdpHdr,
    mask: &UdpHdr,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    matcher.set_u8(base + off::IP_PROTO, 0xff);
    key.set_u8(base + off::IP_PROTO, 17);
    matcher.set_u16(base + off::L4_SPORT, mask.src_port);
    key.set_u16(base + off::L4_SPORT, spec.src_port & mask.src_port);
    matcher.set_u16(base + off::L4_DPORT, mask.dst_port);
    key.set_u16(base + off::L4_DPORT, spec.dst_port & mask.dst_port);
}

fn item_gre(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &GreHdr,
    mask: &GreHdr,
) {
    matcher.set_u8(off::OUTER + off::IP_PROTO, 0xff);
    key.set_u8(off::OUTER + off::IP_PROTO, 47);
    matcher.set_u16(off::GRE_PROTOCOL, mask.protocol);
    key.set_u16(off::GRE_PROTOCOL, spec.protocol & mask.protocol);
}

fn item_icmp(
    matcher: &mut MatchBuf,
    key: &mut MatchBuf,
    spec: &IcmpHdr,
    mask: &IcmpHdr,
    v6: bool,
    inner: bool,
) {
    let base = if inner { off::INNER } else { off::OUTER };
    matcher.set_u8(base + off::IP_PROTO, 0xff);
    key.set_u8(base + off::IP_PROTO, if v6 { 58 } else { 1 });
    matcher.set_u8(base + off::ICMP_TYPE, mask.icmp_type);
    key.set_u8(base + off::ICMP_TYPE, spec.icmp_type & mask.icmp_type);
    matcher.set_u8(base + off::ICMP_CODE, mask.code);
    key.set_u8(base + off::ICMP_CODE, spec.code & mask.code);
}

/// Fold a matched layer's hash contribution in, respecting the RSS
/// request's level and type mask.
fn hashfields_adjust(
    rss_on: bool,
    rss_level: u32,
    rss_types: u64,
    tunnel: bool,
    types: u64,
    fields: u64,
) -> u64 {
    if !rss_on {
        return 0;
    }
    // Level <= 1 hashes the outer headers; deeper levels hash the
    // tunnel payload.
    if tunnel != (rss_level > 1) {
        return 0;
    }
    if rss_types & types == 0 {
        return 0;
    }
    fields
}

/// Compile `items`/`actions` into the flow's device state. On error
/// everything acquired for this flow so far is released again.
pub(super) fn translate(
    sh: &SharedCtx,
    dev: &Arc<dyn RuleDevice>,
    caps: &RuleDeviceCaps,
    flow: &mut Flow,
    attr: &RuleAttr,
    items: &[RuleItem],
    actions: &[RuleAction],
) -> Result<(), RuleError> {
    match translate_inner(sh, dev, caps, flow, attr, items, actions) {
        Ok(()) => Ok(()),
        Err(e) => {
            super::release_flow_resources(sh, dev, flow);
            Err(e)
        }
    }
}

fn translate_inner(
    sh: &SharedCtx,
    dev: &Arc<dyn RuleDevice>,
    caps: &RuleDeviceCaps,
    flow: &mut Flow,
    attr: &RuleAttr,
    items: &[RuleItem],
    actions: &[RuleAction],
) -> Result<(), RuleError> {
    let table = group_to_table(caps, attr, attr.group, ErrorCause::Attributes)?;
    flow.group = table;
    flow.transfer = attr.transfer;
    flow.egress = attr.egress;

    let ft_type = if attr.transfer {
        TableType::Transfer
    } else if attr.egress {
        TableType::Tx
    } else {
        TableType::Rx
    };
    let root = table == 0;
    let priority = if attr.priority == PRIORITY_ANY {
        caps.flow_prio - 1
    } else {
        attr.priority
    };

    let pattern = PatternAttrs::init(items);
    let mut action_flags = ActionFlags::empty();
    let mut modify_res = ModifyHdrSpec {
        ft_type: Some(ft_type),
        root,
        cmds: Vec::new(),
    };
    let mut modify_pos: Option<usize> = None;
    let mut vlan: Option<VlanHdr> = None;

    for (n, action) in actions.iter().enumerate() {
        let dev_err = |e: crate::api::FlowError| {
            RuleError::new(e.kind, ErrorCause::Action(n), e.reason)
        };

        match action {
            RuleAction::Drop => {
                action_flags |= ActionFlags::DROP;
            }
            RuleAction::Queue { index } => {
                flow.queues = vec![*index];
                action_flags |= ActionFlags::QUEUE;
            }
            RuleAction::Rss(spec) => {
                flow.queues = spec.queues.clone();
                if let Some(key) = &spec.key {
                    // Length was checked at validation.
                    flow.rss_key.copy_from_slice(key);
                }
                flow.rss_types = if spec.types == 0 {
                    rss_types::IP
                } else {
                    spec.types
                };
                flow.rss_level = spec.level;
                action_flags |= ActionFlags::RSS;
            }
            RuleAction::Count { shared, id } => {
                let counter = sh
                    .counters
                    .alloc(dev, caps, *shared, *id, flow.group)
                    .map_err(dev_err)?;
                flow.dev_flows[0].actions.push(counter.action());
                flow.counter = Some(counter);
                action_flags |= ActionFlags::COUNT;
            }
            RuleAction::Flag => {
                if flow.tag.is_none() {
                    let tag = sh
                        .register_tag(mark_to_tag(FLOW_MARK_DEFAULT))
                        .map_err(dev_err)?;
                    flow.tag = Some(tag);
                }
                flow.dev_flows[0]
                    .actions
                    .push(flow.tag.as_ref().unwrap().action);
                action_flags |= ActionFlags::FLAG;
            }
            RuleAction::Mark { id } => {
                if flow.tag.is_none() {
                    let tag = sh
                        .register_tag(mark_to_tag(*id))
                        .map_err(dev_err)?;
                    flow.tag = Some(tag);
                }
                flow.dev_flows[0]
                    .actions
                    .push(flow.tag.as_ref().unwrap().action);
                action_flags |= ActionFlags::MARK;
            }
            RuleAction::Jump { group } => {
                let target =
                    group_to_table(caps, attr, *group, ErrorCause::Action(n))?;
                let tbl = sh.get_table(ft_type, target).map_err(dev_err)?;
                let jump = match sh.register_jump(tbl) {
                    Ok(j) => j,
                    Err(e) => return Err(dev_err(e)),
                };
                flow.dev_flows[0].actions.push(jump.action);
                flow.dev_flows[0].jump = Some(jump);
                action_flags |= ActionFlags::JUMP;
            }
            RuleAction::PortId { id, original } => {
                let port = if *original { caps.own_port } else { *id };
                let res = sh.register_port_id(port).map_err(dev_err)?;
                flow.dev_flows[0].actions.push(res.action);
                flow.dev_flows[0].port_id_action = Some(res);
                action_flags |= ActionFlags::PORT_ID;
            }
            RuleAction::PopVlan => {
                let act = dev.pop_vlan_action().ok_or_else(|| {
                    RuleError::action(
                        n,
                        ErrorKind::Unsupported,
                        "VLAN pop is not supported",
                    )
                })?;
                flow.dev_flows[0].actions.push(act);
                action_flags |= ActionFlags::OF_POP_VLAN;
            }
            RuleAction::PushVlan { ether_type } => {
                let mut hdr =
                    vlan.take().unwrap_or_else(|| vlan_from_items(items));
                hdr.inner_type = *ether_type;
                let tag =
                    (u32::from(*ether_type) << 16) | u32::from(hdr.tci);
                let res = sh
                    .register_push_vlan(ft_type, tag)
                    .map_err(dev_err)?;
                flow.dev_flows[0].actions.push(res.action);
                flow.dev_flows[0].push_vlan = Some(res);
                vlan = Some(hdr);
                action_flags |= ActionFlags::OF_PUSH_VLAN;
                // The push carries the VID; drop any pending rewrite.
                action_flags -= ActionFlags::OF_SET_VLAN_VID;
            }
            RuleAction::SetVlanPcp { pcp } => {
                let mut hdr =
                    vlan.take().unwrap_or_else(|| vlan_from_items(items));
                hdr.tci =
                    (hdr.tci & !0xe000) | (u16::from(*pcp) << 13);
                vlan = Some(hdr);
            }
            RuleAction::SetVlanVid { vid } => {
                let mut hdr =
                    vlan.take().unwrap_or_else(|| vlan_from_items(items));
                hdr.tci = (hdr.tci & !0x0fff) | (vid & 0x0fff);
                vlan = Some(hdr);
                // Without a following push this rewrites the existing
                // header.
                if !actions[n + 1..]
                    .iter()
                    .any(|a| matches!(a, RuleAction::PushVlan { .. }))
                {
                    modify::convert_vlan_vid(&mut modify_res, *vid)
                        .map_err(dev_err)?;
                    action_flags |= ActionFlags::OF_SET_VLAN_VID;
                }
            }
            RuleAction::TunnelEncap { items } => {
                let data = build_encap(items)?;
                let res = sh
                    .register_encap_decap(
                        ReformatKind::Encap,
                        ft_type,
                        root,
                        data,
                    )
                    .map_err(dev_err)?;
                flow.dev_flows[0].actions.push(res.action);
                flow.dev_flows[0].encap_decap = Some(res);
                action_flags |= ActionFlags::TUNNEL_ENCAP;
            }
            RuleAction::TunnelDecap => {
                let res = sh
                    .register_encap_decap(
                        ReformatKind::Decap,
                        ft_type,
                        root,
                        Vec::new(),
                    )
                    .map_err(dev_err)?;
                flow.dev_flows[0].actions.push(res.action);
                flow.dev_flows[0].encap_decap = Some(res);
                action_flags |= ActionFlags::TUNNEL_DECAP;
            }
            RuleAction::RawEncap { data } => {
                // A preceding raw decap fuses with this encap into a
                // single rewrite of the new header bytes.
                let res = sh
                    .register_encap_decap(
                        ReformatKind::Encap,
                        ft_type,
                        root,
                        data.clone(),
                    )
                    .map_err(dev_err)?;
                flow.dev_flows[0].actions.push(res.action);
                flow.dev_flows[0].encap_decap = Some(res);
                action_flags |= ActionFlags::RAW_ENCAP;
            }
            RuleAction::RawDecap => {
                // Handled at the encap when one follows.
                if !actions[n + 1..]
                    .iter()
                    .any(|a| matches!(a, RuleAction::RawEncap { .. }))
                {
                    let res = sh
                        .register_encap_decap(
                            ReformatKind::Decap,
                            ft_type,
                            root,
                            Vec::new(),
                        )
                        .map_err(dev_err)?;
                    flow.dev_flows[0].actions.push(res.action);
                    flow.dev_flows[0].encap_decap = Some(res);
                }
                action_flags |= ActionFlags::RAW_DECAP;
            }
            RuleAction::SetMacSrc(mac) => {
                modify::convert_mac(&mut modify_res, *mac, false)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_MAC_SRC;
            }
            RuleAction::SetMacDst(mac) => {
                modify::convert_mac(&mut modify_res, *mac, true)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_MAC_DST;
            }
            RuleAction::SetIpv4Src(addr) => {
                modify::convert_ipv4_addr(&mut modify_res, *addr, false)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_IPV4_SRC;
            }
            RuleAction::SetIpv4Dst(addr) => {
                modify::convert_ipv4_addr(&mut modify_res, *addr, true)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_IPV4_DST;
            }
            RuleAction::SetIpv6Src(addr) => {
                modify::convert_ipv6_addr(&mut modify_res, *addr, false)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_IPV6_SRC;
            }
            RuleAction::SetIpv6Dst(addr) => {
                modify::convert_ipv6_addr(&mut modify_res, *addr, true)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_IPV6_DST;
            }
            RuleAction::SetTpSrc(port) => {
                modify::convert_tp(&mut modify_res, *port, false, !pattern.tcp)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_TP_SRC;
            }
            RuleAction::SetTpDst(port) => {
                modify::convert_tp(&mut modify_res, *port, true, !pattern.tcp)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_TP_DST;
            }
            RuleAction::SetTtl(ttl) => {
                let v6 = pattern.ipv6 && !pattern.ipv4;
                modify::convert_ttl(&mut modify_res, *ttl, v6)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::SET_TTL;
            }
            RuleAction::DecTtl => {
                let v6 = pattern.ipv6 && !pattern.ipv4;
                modify::convert_dec_ttl(&mut modify_res, v6)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::DEC_TTL;
            }
            RuleAction::IncTcpSeq(delta) => {
                modify::convert_tcp_adjust(
                    &mut modify_res,
                    *delta,
                    false,
                    false,
                )
                .map_err(dev_err)?;
                action_flags |= ActionFlags::INC_TCP_SEQ;
            }
            RuleAction::DecTcpSeq(delta) => {
                modify::convert_tcp_adjust(&mut modify_res, *delta, true, false)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::DEC_TCP_SEQ;
            }
            RuleAction::IncTcpAck(delta) => {
                modify::convert_tcp_adjust(&mut modify_res, *delta, false, true)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::INC_TCP_ACK;
            }
            RuleAction::DecTcpAck(delta) => {
                modify::convert_tcp_adjust(&mut modify_res, *delta, true, true)
                    .map_err(dev_err)?;
                action_flags |= ActionFlags::DEC_TCP_ACK;
            }
        }

        // The combined rewrite program claims its slot at the first
        // modify action; the handle is patched in when the list ends.
        if action_flags.intersects(ActionFlags::MODIFY_HDR)
            && modify_pos.is_none()
        {
            modify_pos = Some(flow.dev_flows[0].actions.len());
            flow.dev_flows[0].actions.push(ACTION_PLACEHOLDER);
        }
    }

    if action_flags.intersects(ActionFlags::MODIFY_HDR) {
        let res = sh
            .register_modify_hdr(ft_type, root, modify_res.cmds)
            .map_err(|e| {
                RuleError::new(e.kind, ErrorCause::Unspecified, e.reason)
            })?;
        flow.dev_flows[0].actions[modify_pos.unwrap()] = res.action;
        flow.dev_flows[0].modify_hdr = Some(res);
    }
    flow.actions = action_flags;

    // Item pass: fill the matcher mask and the flow's value buffer.
    let mut matcher_buf = MatchBuf::default();
    let mut item_flags = ItemFlags::empty();
    let mut matcher_prio = PRIORITY_MAP_L2;
    let mut hash = 0u64;

    let rss_on = action_flags.contains(ActionFlags::RSS);
    let rss_level = flow.rss_level;
    let rss_types_sel = flow.rss_types;

    {
        let df = &mut flow.dev_flows[0];
        for item in items {
            let tunnel = item_flags.intersects(ItemFlags::TUNNEL);
            let last = match item {
                RuleItem::Eth { spec, mask } => {
                    let m = mask.unwrap_or(EthHdr::FULL_MASK);
                    item_eth(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    matcher_prio = matcher_prio.min(PRIORITY_MAP_L2);
                    if tunnel {
                        ItemFlags::INNER_L2
                    } else {
                        ItemFlags::OUTER_L2
                    }
                }
                RuleItem::Vlan { spec, mask } => {
                    let m = mask.unwrap_or(VlanHdr::FULL_MASK);
                    item_vlan(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    if tunnel {
                        ItemFlags::INNER_VLAN
                    } else {
                        ItemFlags::OUTER_VLAN
                    }
                }
                RuleItem::Ipv4 { spec, mask } => {
                    let m = mask.unwrap_or(Ipv4Hdr::FULL_MASK);
                    item_ipv4(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    matcher_prio = matcher_prio.min(PRIORITY_MAP_L3);
                    hash |= hashfields_adjust(
                        rss_on,
                        rss_level,
                        rss_types_sel,
                        tunnel,
                        rss_types::IPV4,
                        hash_fields::SRC_IPV4 | hash_fields::DST_IPV4,
                    );
                    if tunnel {
                        ItemFlags::INNER_L3_IPV4
                    } else {
                        ItemFlags::OUTER_L3_IPV4
                    }
                }
                RuleItem::Ipv6 { spec, mask } => {
                    let m = mask.unwrap_or(Ipv6Hdr::FULL_MASK);
                    item_ipv6(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    matcher_prio = matcher_prio.min(PRIORITY_MAP_L3);
                    hash |= hashfields_adjust(
                        rss_on,
                        rss_level,
                        rss_types_sel,
                        tunnel,
                        rss_types::IPV6,
                        hash_fields::SRC_IPV6 | hash_fields::DST_IPV6,
                    );
                    if tunnel {
                        ItemFlags::INNER_L3_IPV6
                    } else {
                        ItemFlags::OUTER_L3_IPV6
                    }
                }
                RuleItem::Tcp { spec, mask } => {
                    let m = mask.unwrap_or(TcpHdr::FULL_MASK);
                    item_tcp(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    matcher_prio = matcher_prio.min(PRIORITY_MAP_L4);
                    hash |= hashfields_adjust(
                        rss_on,
                        rss_level,
                        rss_types_sel,
                        tunnel,
                        rss_types::TCP,
                        hash_fields::SRC_PORT_TCP | hash_fields::DST_PORT_TCP,
                    );
                    if tunnel {
                        ItemFlags::INNER_L4_TCP
                    } else {
                        ItemFlags::OUTER_L4_TCP
                    }
                }
                RuleItem::Udp { spec, mask } => {
                    let m = mask.unwrap_or(UdpHdr::FULL_MASK);
                    item_udp(&mut matcher_buf, &mut df.value, spec, &m, tunnel);
                    matcher_prio = matcher_prio.min(PRIORITY_MAP_L4);
                    hash |= hashfields_adjust(
                        rss_on,
                        rss_level,
                        rss_types_sel,
                        tunnel,
                        rss_types::UDP,
                        hash_fields::SRC_PORT_UDP | hash_fields::DST_PORT_UDP,
                    );
                    if tunnel {
                        ItemFlags::INNER_L4_UDP
                    } else {
                        ItemFlags::OUTER_L4_UDP
                    }
                }
                RuleItem::Gre { spec, mask } => {
                    let m = mask.unwrap_or(GreHdr::FULL_MASK);
                    item_gre(&mut matcher_buf, &mut df.value, spec, &m);
                    ItemFlags::GRE
                }
                RuleItem::GreKey { spec, mask } => {
                    let m = mask.unwrap_or(0xffff_ffff);
                    matcher_buf.set_u32(off::GRE_KEY, m);
                    df.value.set_u32(off::GRE_KEY, spec & m);
                    ItemFlags::GRE_KEY
                }
                RuleItem::Vxlan { spec, mask } => {
                    let m = mask.unwrap_or(VxlanHdr::FULL_MASK);
                    matcher_buf.set_u32(off::VXLAN_VNI, m.vni);
                    df.value.set_u32(off::VXLAN_VNI, spec.vni & m.vni);
                    ItemFlags::VXLAN
                }
                RuleItem::Icmp { spec, mask } => {
                    let m = mask.unwrap_or(IcmpHdr::FULL_MASK);
                    item_icmp(
                        &mut matcher_buf,
                        &mut df.value,
                        spec,
                        &m,
                        false,
                        tunnel,
                    );
                    ItemFlags::ICMP
                }
                RuleItem::Icmp6 { spec, mask } => {
                    let m = mask.unwrap_or(IcmpHdr::FULL_MASK);
                    item_icmp(
                        &mut matcher_buf,
                        &mut df.value,
                        spec,
                        &m,
                        true,
                        tunnel,
                    );
                    ItemFlags::ICMP6
                }
                RuleItem::Meta { data, mask } => {
                    let m = mask.unwrap_or(0xffff_ffff);
                    matcher_buf.set_u32(off::META, m);
                    df.value.set_u32(off::META, data & m);
                    ItemFlags::META
                }
                RuleItem::PortId { id } => {
                    matcher_buf.set_u16(off::SOURCE_PORT, 0xffff);
                    df.value.set_u16(off::SOURCE_PORT, *id);
                    ItemFlags::PORT_ID
                }
            };
            item_flags |= last;
        }

        // An ingress rule on a switching device that names no source
        // port implicitly matches its own.
        if attr.ingress
            && caps.esw_enabled
            && (caps.is_master || caps.is_representor)
            && !item_flags.contains(ItemFlags::PORT_ID)
        {
            matcher_buf.set_u16(off::SOURCE_PORT, 0xffff);
            df.value.set_u16(off::SOURCE_PORT, caps.own_port);
        }

        debug_assert!(spec_within_mask(&matcher_buf, &df.value));
        df.layers = item_flags;
        df.hash_fields = hash;
    }

    let spec = MatcherSpec {
        crc: crc32fast::hash(&matcher_buf.buf),
        priority: (priority as u16) * PRIORITY_SUB_LEVELS + matcher_prio,
        ty: ft_type,
        group: table,
        criteria: matcher_enable(&matcher_buf),
        mask: matcher_buf,
    };
    let matcher = sh.register_matcher(spec).map_err(|e| {
        RuleError::new(e.kind, ErrorCause::Unspecified, e.reason)
    })?;
    flow.dev_flows[0].matcher = Some(matcher);

    Ok(())
}
