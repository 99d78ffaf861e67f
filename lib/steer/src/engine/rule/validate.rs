// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Rule admission.
//!
//! A single linear pass over the attributes, then the items, then the
//! actions, accumulating "seen so far" bitmasks and rejecting at the
//! first violation. Validation has no side effects: no hardware state
//! and no cache entries exist for a rejected rule.

use super::super::device::RuleDeviceCaps;
use super::flags::ActionFlags;
use super::flags::ItemFlags;
use super::flags::MAX_ACTIONS;
use crate::api::ErrorCause;
use crate::api::ErrorKind;
use crate::api::RssSpec;
use crate::api::RuleAction;
use crate::api::RuleAttr;
use crate::api::RuleError;
use crate::api::RuleItem;
use crate::api::PRIORITY_ANY;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_IPIP: u8 = 4;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_IPV6: u8 = 41;
const IPPROTO_GRE: u8 = 47;
const IPPROTO_ICMPV6: u8 = 58;

const ETHER_TYPE_VLAN: u16 = 0x8100;
const ETHER_TYPE_QINQ: u16 = 0x88a8;

/// Highest mark value the hardware can carry.
pub const FLOW_MARK_MAX: u32 = 0x00ff_fffe;

/// Map the caller's group index to a device table, bounds-checked
/// against the transfer-dependent maximum.
pub fn group_to_table(
    caps: &RuleDeviceCaps,
    attr: &RuleAttr,
    group: u32,
    cause: ErrorCause,
) -> Result<u32, RuleError> {
    let max = if attr.transfer {
        caps.max_tables_transfer
    } else {
        caps.max_tables
    };
    if group >= max {
        return Err(RuleError::new(
            ErrorKind::InvalidArgument,
            cause,
            "group index out of range",
        ));
    }
    Ok(group)
}

fn validate_attributes(
    caps: &RuleDeviceCaps,
    attr: &RuleAttr,
) -> Result<(), RuleError> {
    group_to_table(caps, attr, attr.group, ErrorCause::Attributes)?;

    if attr.priority != PRIORITY_ANY
        && attr.priority >= caps.flow_prio.saturating_sub(1)
    {
        return Err(RuleError::attr(
            ErrorKind::Unsupported,
            "priority out of range",
        ));
    }

    if attr.transfer {
        if !caps.esw_enabled {
            return Err(RuleError::attr(
                ErrorKind::Unsupported,
                "switching rules are not supported",
            ));
        }
        if !(caps.is_master || caps.is_representor) {
            return Err(RuleError::attr(
                ErrorKind::InvalidArgument,
                "switching rules require a master or representor device",
            ));
        }
        if attr.egress {
            return Err(RuleError::attr(
                ErrorKind::Unsupported,
                "egress is not supported with transfer",
            ));
        }
    }

    if attr.egress == attr.ingress {
        return Err(RuleError::attr(
            ErrorKind::InvalidArgument,
            "must specify exactly one of ingress or egress",
        ));
    }

    Ok(())
}

/// Walk the item list, checking each layer against what came before.
/// Returns the accumulated layer mask.
pub fn validate_items(
    caps: &RuleDeviceCaps,
    attr: &RuleAttr,
    items: &[RuleItem],
) -> Result<ItemFlags, RuleError> {
    let mut item_flags = ItemFlags::empty();
    // The protocol announced by the innermost IP header so far; `None`
    // when unconstrained.
    let mut next_protocol: Option<u8> = None;

    for (n, item) in items.iter().enumerate() {
        let tunnel = item_flags.intersects(ItemFlags::TUNNEL);
        let conflict = |reason| {
            Err(RuleError::item(n, ErrorKind::Conflict, reason))
        };
        let invalid = |reason| {
            Err(RuleError::item(n, ErrorKind::InvalidArgument, reason))
        };

        let l2 = if tunnel { ItemFlags::INNER_L2 } else { ItemFlags::OUTER_L2 };
        let vlan =
            if tunnel { ItemFlags::INNER_VLAN } else { ItemFlags::OUTER_VLAN };
        let l3 = if tunnel { ItemFlags::INNER_L3 } else { ItemFlags::OUTER_L3 };
        let l4 = if tunnel { ItemFlags::INNER_L4 } else { ItemFlags::OUTER_L4 };

        let last = match item {
            RuleItem::Eth { .. } => {
                if item_flags.intersects(l2) {
                    return conflict("multiple L2 layers");
                }
                l2
            }
            RuleItem::Vlan { .. } => {
                if item_flags.intersects(vlan) {
                    return conflict("multiple VLAN layers");
                }
                if item_flags.intersects(l3) {
                    return conflict("VLAN cannot follow an L3 layer");
                }
                if !item_flags.intersects(l2) {
                    return invalid("VLAN without an L2 layer");
                }
                vlan
            }
            RuleItem::Ipv4 { spec, mask } => {
                // An IP header whose parent announced an IP payload is
                // an IP-in-IP tunnel boundary.
                let tunnel = match next_protocol {
                    Some(IPPROTO_IPIP) | Some(IPPROTO_IPV6)
                        if item_flags.intersects(l3) =>
                    {
                        item_flags |= if next_protocol
                            == Some(IPPROTO_IPIP)
                        {
                            ItemFlags::IPIP
                        } else {
                            ItemFlags::IPV6_ENCAP
                        };
                        true
                    }
                    _ => tunnel,
                };
                let (l3, l4, this) = if tunnel {
                    (
                        ItemFlags::INNER_L3,
                        ItemFlags::INNER_L4,
                        ItemFlags::INNER_L3_IPV4,
                    )
                } else {
                    (
                        ItemFlags::OUTER_L3,
                        ItemFlags::OUTER_L4,
                        ItemFlags::OUTER_L3_IPV4,
                    )
                };
                if item_flags.intersects(l3) {
                    return conflict("multiple L3 layers");
                }
                if item_flags.intersects(l4) {
                    return conflict("L3 cannot follow an L4 layer");
                }

                let m = mask.unwrap_or(crate::api::Ipv4Hdr::FULL_MASK);
                next_protocol = if m.proto != 0 {
                    Some(spec.proto & m.proto)
                } else {
                    None
                };
                this
            }
            RuleItem::Ipv6 { spec, mask } => {
                let tunnel = match next_protocol {
                    Some(IPPROTO_IPIP) | Some(IPPROTO_IPV6)
                        if item_flags.intersects(l3) =>
                    {
                        item_flags |= ItemFlags::IPV6_ENCAP;
                        true
                    }
                    _ => tunnel,
                };
                let (l3, l4, this) = if tunnel {
                    (
                        ItemFlags::INNER_L3,
                        ItemFlags::INNER_L4,
                        ItemFlags::INNER_L3_IPV6,
                    )
                } else {
                    (
                        ItemFlags::OUTER_L3,
                        ItemFlags::OUTER_L4,
                        ItemFlags::OUTER_L3_IPV6,
                    )
                };
                if item_flags.intersects(l3) {
                    return conflict("multiple L3 layers");
                }
                if item_flags.intersects(l4) {
                    return conflict("L3 cannot follow an L4 layer");
                }

                let m = mask.unwrap_or(crate::api::Ipv6Hdr::FULL_MASK);
                next_protocol = if m.proto != 0 {
                    Some(spec.proto & m.proto)
                } else {
                    None
                };
                this
            }
            RuleItem::Tcp { .. } | RuleItem::Udp { .. } => {
                let proto = if matches!(item, RuleItem::Tcp { .. }) {
                    IPPROTO_TCP
                } else {
                    IPPROTO_UDP
                };
                if !item_flags.intersects(l3) {
                    return invalid("L4 layer without an L3 layer");
                }
                if item_flags.intersects(l4) {
                    return conflict("multiple L4 layers");
                }
                if let Some(p) = next_protocol {
                    if p != proto {
                        return invalid(
                            "IP next protocol disagrees with the L4 layer",
                        );
                    }
                }
                match (tunnel, proto) {
                    (false, IPPROTO_TCP) => ItemFlags::OUTER_L4_TCP,
                    (false, _) => ItemFlags::OUTER_L4_UDP,
                    (true, IPPROTO_TCP) => ItemFlags::INNER_L4_TCP,
                    (true, _) => ItemFlags::INNER_L4_UDP,
                }
            }
            RuleItem::Gre { .. } => {
                if item_flags.intersects(ItemFlags::TUNNEL) {
                    return conflict("multiple tunnel layers");
                }
                if !item_flags.intersects(ItemFlags::OUTER_L3) {
                    return invalid("GRE without an outer L3 layer");
                }
                if let Some(p) = next_protocol {
                    if p != IPPROTO_GRE {
                        return invalid(
                            "IP next protocol disagrees with GRE",
                        );
                    }
                }
                ItemFlags::GRE
            }
            RuleItem::GreKey { .. } => {
                if !item_flags.contains(ItemFlags::GRE) {
                    return invalid("GRE key without a GRE layer");
                }
                ItemFlags::GRE_KEY
            }
            RuleItem::Vxlan { .. } => {
                if item_flags.intersects(ItemFlags::TUNNEL) {
                    return conflict("multiple tunnel layers");
                }
                if !item_flags.contains(ItemFlags::OUTER_L4_UDP) {
                    return invalid("VXLAN without an outer UDP layer");
                }
                ItemFlags::VXLAN
            }
            RuleItem::Icmp { .. } => {
                if !item_flags.intersects(ItemFlags::L3_IPV4) {
                    return invalid("ICMP without an IPv4 layer");
                }
                if let Some(p) = next_protocol {
                    if p != IPPROTO_ICMP {
                        return invalid(
                            "IP next protocol disagrees with ICMP",
                        );
                    }
                }
                ItemFlags::ICMP
            }
            RuleItem::Icmp6 { .. } => {
                if !item_flags.intersects(ItemFlags::L3_IPV6) {
                    return invalid("ICMPv6 without an IPv6 layer");
                }
                if let Some(p) = next_protocol {
                    if p != IPPROTO_ICMPV6 {
                        return invalid(
                            "IP next protocol disagrees with ICMPv6",
                        );
                    }
                }
                ItemFlags::ICMP6
            }
            RuleItem::Meta { data, .. } => {
                if !caps.match_meta {
                    return Err(RuleError::item(
                        n,
                        ErrorKind::Unsupported,
                        "metadata matching is off for this port",
                    ));
                }
                if *data == 0 {
                    return invalid("metadata value cannot be zero");
                }
                if attr.ingress {
                    return Err(RuleError::item(
                        n,
                        ErrorKind::Unsupported,
                        "metadata match is not supported for ingress",
                    ));
                }
                ItemFlags::META
            }
            RuleItem::PortId { .. } => {
                if !attr.transfer {
                    return invalid(
                        "port match is valid only in transfer rules",
                    );
                }
                if item_flags.contains(ItemFlags::PORT_ID) {
                    return conflict("multiple source ports");
                }
                ItemFlags::PORT_ID
            }
        };

        item_flags |= last;
    }

    Ok(item_flags)
}

/// Fold a header-rewrite sub-action into the running totals; the
/// whole rewrite group counts as one compiled action.
fn count_modify(
    action_flags: &mut ActionFlags,
    actions_n: &mut usize,
    flag: ActionFlags,
) {
    if !action_flags.intersects(ActionFlags::MODIFY_HDR) {
        *actions_n += 1;
    }
    *action_flags |= flag;
}

fn validate_rss(spec: &RssSpec, n: usize) -> Result<(), RuleError> {
    if spec.queues.is_empty() {
        return Err(RuleError::action(
            n,
            ErrorKind::InvalidArgument,
            "RSS queue list cannot be empty",
        ));
    }
    if let Some(key) = &spec.key {
        if key.len() != crate::api::RSS_HASH_KEY_LEN {
            return Err(RuleError::action(
                n,
                ErrorKind::InvalidArgument,
                "RSS hash key has the wrong length",
            ));
        }
    }
    if spec.level > 2 {
        return Err(RuleError::action(
            n,
            ErrorKind::Unsupported,
            "RSS hash level too deep",
        ));
    }
    Ok(())
}

/// Admit or reject a rule. The first violation short-circuits with the
/// offending element; success guarantees the translator can compile
/// the rule without semantic surprises.
pub fn validate(
    caps: &RuleDeviceCaps,
    attr: &RuleAttr,
    items: &[RuleItem],
    actions: &[RuleAction],
) -> Result<(), RuleError> {
    validate_attributes(caps, attr)?;
    let item_flags = validate_items(caps, attr, items)?;

    let mut action_flags = ActionFlags::empty();
    let mut actions_n = 0usize;

    for (n, action) in actions.iter().enumerate() {
        if actions_n == MAX_ACTIONS {
            return Err(RuleError::action(
                n,
                ErrorKind::ResourceExhausted,
                "too many actions",
            ));
        }
        let conflict = |reason| {
            Err(RuleError::action(n, ErrorKind::Conflict, reason))
        };
        let invalid = |reason| {
            Err(RuleError::action(n, ErrorKind::InvalidArgument, reason))
        };
        let unsupported = |reason| {
            Err(RuleError::action(n, ErrorKind::Unsupported, reason))
        };

        match action {
            RuleAction::Drop => {
                if action_flags
                    .intersects(ActionFlags::FATE | ActionFlags::FATE_ESWITCH)
                {
                    return conflict("can't have 2 fate actions");
                }
                action_flags |= ActionFlags::DROP;
                actions_n += 1;
            }
            RuleAction::Queue { .. } => {
                if action_flags
                    .intersects(ActionFlags::FATE | ActionFlags::FATE_ESWITCH)
                {
                    return conflict("can't have 2 fate actions");
                }
                action_flags |= ActionFlags::QUEUE;
                actions_n += 1;
            }
            RuleAction::Rss(spec) => {
                if action_flags
                    .intersects(ActionFlags::FATE | ActionFlags::FATE_ESWITCH)
                {
                    return conflict("can't have 2 fate actions");
                }
                validate_rss(spec, n)?;
                action_flags |= ActionFlags::RSS;
                actions_n += 1;
            }
            RuleAction::Count { .. } => {
                if !caps.counters_supported {
                    return unsupported("count action not supported");
                }
                action_flags |= ActionFlags::COUNT;
                actions_n += 1;
            }
            RuleAction::Flag => {
                if action_flags
                    .intersects(ActionFlags::FLAG | ActionFlags::MARK)
                {
                    return conflict("can't mark and flag in same rule");
                }
                action_flags |= ActionFlags::FLAG;
                actions_n += 1;
            }
            RuleAction::Mark { id } => {
                if *id > FLOW_MARK_MAX {
                    return invalid("mark value too large");
                }
                if action_flags
                    .intersects(ActionFlags::FLAG | ActionFlags::MARK)
                {
                    return conflict("can't mark and flag in same rule");
                }
                action_flags |= ActionFlags::MARK;
                actions_n += 1;
            }
            RuleAction::Jump { group } => {
                if action_flags
                    .intersects(ActionFlags::FATE | ActionFlags::FATE_ESWITCH)
                {
                    return conflict("can't have 2 fate actions");
                }
                let table = group_to_table(
                    caps,
                    attr,
                    *group,
                    ErrorCause::Action(n),
                )?;
                if attr.group >= table {
                    return invalid(
                        "target group must be higher than the current group",
                    );
                }
                action_flags |= ActionFlags::JUMP;
                actions_n += 1;
            }
            RuleAction::PortId { .. } => {
                if !attr.transfer {
                    return unsupported(
                        "port redirect is valid in transfer rules only",
                    );
                }
                if action_flags
                    .intersects(ActionFlags::FATE | ActionFlags::FATE_ESWITCH)
                {
                    return conflict("can't have 2 fate actions");
                }
                action_flags |= ActionFlags::PORT_ID;
                actions_n += 1;
            }
            RuleAction::PopVlan => {
                if !caps.pop_vlan_supported {
                    return unsupported("VLAN pop is not supported");
                }
                if action_flags.contains(ActionFlags::OF_POP_VLAN) {
                    return conflict("multiple VLAN pop actions");
                }
                if !item_flags.contains(ItemFlags::OUTER_VLAN) {
                    return invalid(
                        "cannot pop VLAN without a match on (outer) VLAN",
                    );
                }
                action_flags |= ActionFlags::OF_POP_VLAN;
                actions_n += 1;
            }
            RuleAction::PushVlan { ether_type } => {
                if *ether_type != ETHER_TYPE_VLAN
                    && *ether_type != ETHER_TYPE_QINQ
                {
                    return invalid("invalid VLAN ethertype");
                }
                if action_flags.intersects(ActionFlags::VLAN) {
                    return conflict("multiple VLAN actions");
                }
                action_flags |= ActionFlags::OF_PUSH_VLAN;
                actions_n += 1;
            }
            RuleAction::SetVlanPcp { pcp } => {
                if *pcp > 7 {
                    return invalid("VLAN PCP value too large");
                }
                if action_flags.contains(ActionFlags::OF_PUSH_VLAN) {
                    return conflict(
                        "set VLAN PCP must precede the VLAN push",
                    );
                }
                if !actions[n..]
                    .iter()
                    .any(|a| matches!(a, RuleAction::PushVlan { .. }))
                {
                    return unsupported(
                        "set VLAN PCP works only with a VLAN push",
                    );
                }
                // Folded into the push; not counted.
            }
            RuleAction::SetVlanVid { vid } => {
                if *vid > 0x0ffe {
                    return invalid("VLAN VID value too large");
                }
                // A following push consumes this action wholesale.
                if !actions[n + 1..]
                    .iter()
                    .any(|a| matches!(a, RuleAction::PushVlan { .. }))
                {
                    if actions[n + 1..].iter().any(|a| {
                        matches!(a, RuleAction::SetVlanVid { .. })
                    }) {
                        return unsupported(
                            "multiple VLAN VID modifications",
                        );
                    }
                    if !item_flags.contains(ItemFlags::OUTER_VLAN) {
                        return invalid(
                            "a VLAN match is required to set the VLAN VID",
                        );
                    }
                }
            }
            RuleAction::TunnelEncap { items } => {
                if items.is_empty() {
                    return invalid("encap description cannot be empty");
                }
                if action_flags.contains(ActionFlags::DROP) {
                    return conflict("can't drop and encap in same rule");
                }
                if action_flags
                    .intersects(ActionFlags::ENCAP | ActionFlags::DECAP)
                {
                    return conflict(
                        "only a single encap or decap action per rule",
                    );
                }
                if !attr.transfer && attr.ingress {
                    return unsupported(
                        "encap is not supported for ingress",
                    );
                }
                action_flags |= ActionFlags::TUNNEL_ENCAP;
                actions_n += 1;
            }
            RuleAction::TunnelDecap => {
                if action_flags.contains(ActionFlags::DROP) {
                    return conflict("can't drop and decap in same rule");
                }
                if action_flags
                    .intersects(ActionFlags::ENCAP | ActionFlags::DECAP)
                {
                    return conflict(
                        "only a single encap or decap action per rule",
                    );
                }
                if action_flags.intersects(ActionFlags::MODIFY_HDR) {
                    return conflict(
                        "can't decap after a modify action",
                    );
                }
                if attr.egress {
                    return unsupported(
                        "decap is not supported for egress",
                    );
                }
                action_flags |= ActionFlags::TUNNEL_DECAP;
                actions_n += 1;
            }
            RuleAction::RawEncap { data } => {
                if data.is_empty() {
                    return invalid("raw encap data cannot be empty");
                }
                if action_flags.contains(ActionFlags::DROP) {
                    return conflict("can't drop and encap in same rule");
                }
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict("only a single encap action per rule");
                }
                // Encap without a preceding decap cannot work on
                // ingress.
                if !attr.transfer
                    && attr.ingress
                    && !action_flags.contains(ActionFlags::RAW_DECAP)
                {
                    return unsupported(
                        "encap is not supported for ingress",
                    );
                }
                action_flags |= ActionFlags::RAW_ENCAP;
                actions_n += 1;
            }
            RuleAction::RawDecap => {
                if action_flags.contains(ActionFlags::DROP) {
                    return conflict("can't drop and decap in same rule");
                }
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't have an encap action before a decap",
                    );
                }
                if action_flags.intersects(ActionFlags::DECAP) {
                    return conflict("only a single decap action per rule");
                }
                if action_flags.intersects(ActionFlags::MODIFY_HDR) {
                    return conflict(
                        "can't decap after a modify action",
                    );
                }
                // Decap on egress only makes sense as the front half
                // of a decap-then-encap rewrite.
                if attr.egress
                    && !actions[n + 1..]
                        .iter()
                        .any(|a| matches!(a, RuleAction::RawEncap { .. }))
                {
                    return unsupported(
                        "decap is not supported for egress",
                    );
                }
                action_flags |= ActionFlags::RAW_DECAP;
                actions_n += 1;
            }
            RuleAction::SetMacSrc(_) | RuleAction::SetMacDst(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.intersects(ItemFlags::L2) {
                    return invalid("no L2 item in pattern");
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if matches!(action, RuleAction::SetMacSrc(_)) {
                        ActionFlags::SET_MAC_SRC
                    } else {
                        ActionFlags::SET_MAC_DST
                    },
                );
            }
            RuleAction::SetIpv4Src(_) | RuleAction::SetIpv4Dst(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.intersects(ItemFlags::L3_IPV4) {
                    return invalid("no IPv4 item in pattern");
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if matches!(action, RuleAction::SetIpv4Src(_)) {
                        ActionFlags::SET_IPV4_SRC
                    } else {
                        ActionFlags::SET_IPV4_DST
                    },
                );
            }
            RuleAction::SetIpv6Src(_) | RuleAction::SetIpv6Dst(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.intersects(ItemFlags::L3_IPV6) {
                    return invalid("no IPv6 item in pattern");
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if matches!(action, RuleAction::SetIpv6Src(_)) {
                        ActionFlags::SET_IPV6_SRC
                    } else {
                        ActionFlags::SET_IPV6_DST
                    },
                );
            }
            RuleAction::SetTpSrc(_) | RuleAction::SetTpDst(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.intersects(ItemFlags::L4) {
                    return invalid("no transport layer in pattern");
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if matches!(action, RuleAction::SetTpSrc(_)) {
                        ActionFlags::SET_TP_SRC
                    } else {
                        ActionFlags::SET_TP_DST
                    },
                );
            }
            RuleAction::SetTtl(_) | RuleAction::DecTtl => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.intersects(ItemFlags::L3) {
                    return invalid("no IP layer in pattern");
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if matches!(action, RuleAction::SetTtl(_)) {
                        ActionFlags::SET_TTL
                    } else {
                        ActionFlags::DEC_TTL
                    },
                );
            }
            RuleAction::IncTcpSeq(_) | RuleAction::DecTcpSeq(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.contains(ItemFlags::OUTER_L4_TCP) {
                    return invalid("no TCP item in pattern");
                }
                let inc = matches!(action, RuleAction::IncTcpSeq(_));
                if (inc
                    && action_flags.contains(ActionFlags::DEC_TCP_SEQ))
                    || (!inc
                        && action_flags.contains(ActionFlags::INC_TCP_SEQ))
                {
                    return conflict(
                        "cannot both increase and decrease the TCP \
                         sequence number",
                    );
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if inc {
                        ActionFlags::INC_TCP_SEQ
                    } else {
                        ActionFlags::DEC_TCP_SEQ
                    },
                );
            }
            RuleAction::IncTcpAck(_) | RuleAction::DecTcpAck(_) => {
                if action_flags.intersects(ActionFlags::ENCAP) {
                    return conflict(
                        "can't modify headers after an encap action",
                    );
                }
                if !item_flags.contains(ItemFlags::OUTER_L4_TCP) {
                    return invalid("no TCP item in pattern");
                }
                let inc = matches!(action, RuleAction::IncTcpAck(_));
                if (inc
                    && action_flags.contains(ActionFlags::DEC_TCP_ACK))
                    || (!inc
                        && action_flags.contains(ActionFlags::INC_TCP_ACK))
                {
                    return conflict(
                        "cannot both increase and decrease the TCP \
                         acknowledgment number",
                    );
                }
                count_modify(
                    &mut action_flags,
                    &mut actions_n,
                    if inc {
                        ActionFlags::INC_TCP_ACK
                    } else {
                        ActionFlags::DEC_TCP_ACK
                    },
                );
            }
        }
    }

    if item_flags.intersects(ItemFlags::TUNNEL)
        && action_flags.intersects(ActionFlags::VLAN)
    {
        return Err(RuleError::new(
            ErrorKind::Conflict,
            ErrorCause::Unspecified,
            "can't combine tunnel matches with VLAN actions",
        ));
    }

    if attr.transfer {
        for bad in [
            (ActionFlags::FLAG, "FLAG"),
            (ActionFlags::MARK, "MARK"),
            (ActionFlags::QUEUE, "QUEUE"),
            (ActionFlags::RSS, "RSS"),
        ] {
            if action_flags.contains(bad.0) {
                return Err(RuleError::new(
                    ErrorKind::Unsupported,
                    ErrorCause::Unspecified,
                    format!("unsupported action {} in transfer rule", bad.1),
                ));
            }
        }
        if !action_flags.intersects(ActionFlags::FATE_ESWITCH) {
            return Err(RuleError::new(
                ErrorKind::InvalidArgument,
                ErrorCause::Unspecified,
                "no fate action found",
            ));
        }
    } else if attr.ingress && !action_flags.intersects(ActionFlags::FATE) {
        return Err(RuleError::new(
            ErrorKind::InvalidArgument,
            ErrorCause::Unspecified,
            "no fate action found",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::EthHdr;
    use crate::api::Ipv4Hdr;
    use crate::api::TcpHdr;
    use crate::api::UdpHdr;
    use crate::api::VlanHdr;

    fn caps() -> RuleDeviceCaps {
        RuleDeviceCaps::default()
    }

    fn ingress() -> RuleAttr {
        RuleAttr { ingress: true, ..Default::default() }
    }

    fn eth() -> RuleItem {
        RuleItem::Eth { spec: EthHdr::default(), mask: None }
    }

    fn ipv4(proto: u8) -> RuleItem {
        RuleItem::Ipv4 {
            spec: Ipv4Hdr { proto, ..Default::default() },
            mask: Some(Ipv4Hdr { proto: 0xff, ..Default::default() }),
        }
    }

    fn udp() -> RuleItem {
        RuleItem::Udp { spec: UdpHdr::default(), mask: None }
    }

    fn vlan() -> RuleItem {
        RuleItem::Vlan { spec: VlanHdr::default(), mask: None }
    }

    fn assert_err(
        res: Result<(), RuleError>,
        kind: ErrorKind,
        cause: ErrorCause,
    ) {
        let err = res.unwrap_err();
        assert_eq!(err.kind, kind, "{}", err);
        assert_eq!(err.cause, cause, "{}", err);
    }

    #[test]
    fn two_fate_actions_rejected() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(0)],
                &[RuleAction::Drop, RuleAction::Drop],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );

        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(0)],
                &[
                    RuleAction::Queue { index: 1 },
                    RuleAction::Jump { group: 1 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );
    }

    #[test]
    fn exactly_one_direction() {
        let attr = RuleAttr::default();
        assert_err(
            validate(&caps(), &attr, &[eth()], &[RuleAction::Drop]),
            ErrorKind::InvalidArgument,
            ErrorCause::Attributes,
        );

        let attr = RuleAttr { ingress: true, egress: true, ..attr };
        assert!(validate(&caps(), &attr, &[eth()], &[RuleAction::Drop])
            .is_err());
    }

    #[test]
    fn transfer_requires_capability_and_role() {
        let attr = RuleAttr { transfer: true, ingress: true, ..Default::default() };
        assert_err(
            validate(&caps(), &attr, &[eth()], &[RuleAction::Drop]),
            ErrorKind::Unsupported,
            ErrorCause::Attributes,
        );

        let caps = RuleDeviceCaps {
            esw_enabled: true,
            is_master: false,
            is_representor: false,
            ..caps()
        };
        assert_err(
            validate(&caps, &attr, &[eth()], &[RuleAction::Drop]),
            ErrorKind::InvalidArgument,
            ErrorCause::Attributes,
        );
    }

    #[test]
    fn priority_and_group_bounds() {
        let attr = RuleAttr { priority: 999, ingress: true, ..Default::default() };
        assert_err(
            validate(&caps(), &attr, &[eth()], &[RuleAction::Drop]),
            ErrorKind::Unsupported,
            ErrorCause::Attributes,
        );

        let attr = RuleAttr { group: 999, ingress: true, ..Default::default() };
        assert_err(
            validate(&caps(), &attr, &[eth()], &[RuleAction::Drop]),
            ErrorKind::InvalidArgument,
            ErrorCause::Attributes,
        );
    }

    #[test]
    fn vlan_pop_needs_vlan_match() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(0)],
                &[RuleAction::PopVlan, RuleAction::Queue { index: 0 }],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Action(0),
        );

        assert!(validate(
            &caps(),
            &ingress(),
            &[eth(), vlan(), ipv4(0)],
            &[RuleAction::PopVlan, RuleAction::Queue { index: 0 }],
        )
        .is_ok());
    }

    #[test]
    fn push_and_pop_conflict() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), vlan()],
                &[
                    RuleAction::PopVlan,
                    RuleAction::PushVlan { ether_type: 0x8100 },
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );
    }

    #[test]
    fn set_vlan_pcp_ordering() {
        // Without any push.
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), vlan()],
                &[
                    RuleAction::SetVlanPcp { pcp: 3 },
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Unsupported,
            ErrorCause::Action(0),
        );

        // After the push.
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth()],
                &[
                    RuleAction::PushVlan { ether_type: 0x8100 },
                    RuleAction::SetVlanPcp { pcp: 3 },
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );

        // Before the push.
        assert!(validate(
            &caps(),
            &ingress(),
            &[eth()],
            &[
                RuleAction::SetVlanPcp { pcp: 3 },
                RuleAction::PushVlan { ether_type: 0x8100 },
                RuleAction::Queue { index: 0 },
            ],
        )
        .is_ok());
    }

    #[test]
    fn decap_after_modify_rejected() {
        assert_err(
            validate(
                &caps(),
                &RuleAttr { transfer: false, egress: false, ingress: true, ..Default::default() },
                &[eth(), ipv4(17), udp()],
                &[
                    RuleAction::SetTpDst(53),
                    RuleAction::RawDecap,
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );
    }

    #[test]
    fn modify_after_encap_rejected() {
        let attr = RuleAttr { egress: true, ..Default::default() };
        assert_err(
            validate(
                &caps(),
                &attr,
                &[eth(), ipv4(17), udp()],
                &[
                    RuleAction::RawEncap { data: vec![0; 14] },
                    RuleAction::SetTpDst(53),
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );
    }

    #[test]
    fn decap_then_encap_allowed_on_egress() {
        let attr = RuleAttr { egress: true, ..Default::default() };
        assert!(validate(
            &caps(),
            &attr,
            &[eth(), ipv4(17), udp()],
            &[
                RuleAction::RawDecap,
                RuleAction::RawEncap { data: vec![0; 14] },
            ],
        )
        .is_ok());

        // Decap alone on egress is not expressible.
        assert_err(
            validate(&caps(), &attr, &[eth(), ipv4(17), udp()], &[
                RuleAction::RawDecap,
            ]),
            ErrorKind::Unsupported,
            ErrorCause::Action(0),
        );
    }

    #[test]
    fn tcp_seq_inc_and_dec_conflict() {
        let tcp = RuleItem::Tcp { spec: TcpHdr::default(), mask: None };
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(6), tcp],
                &[
                    RuleAction::IncTcpSeq(10),
                    RuleAction::DecTcpSeq(5),
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Action(1),
        );
    }

    #[test]
    fn modify_requires_matching_layer() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth()],
                &[RuleAction::SetIpv4Src(1), RuleAction::Drop],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Action(0),
        );
    }

    #[test]
    fn meta_match_gated() {
        let meta = RuleItem::Meta { data: 7, mask: None };
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[meta.clone()],
                &[RuleAction::Drop],
            ),
            ErrorKind::Unsupported,
            ErrorCause::Item(0),
        );

        let caps = RuleDeviceCaps { match_meta: true, ..caps() };
        let egress = RuleAttr { egress: true, ..Default::default() };
        assert!(validate(&caps, &egress, &[meta], &[RuleAction::Drop])
            .is_ok());
    }

    #[test]
    fn layer_ordering_enforced() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), udp()],
                &[RuleAction::Drop],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Item(1),
        );

        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(0), ipv4(0)],
                &[RuleAction::Drop],
            ),
            ErrorKind::Conflict,
            ErrorCause::Item(2),
        );

        // Next-protocol disagreement.
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(IPPROTO_TCP), udp()],
                &[RuleAction::Drop],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Item(2),
        );
    }

    #[test]
    fn vxlan_layering() {
        let vxlan = RuleItem::Vxlan {
            spec: crate::api::VxlanHdr { vni: 7 },
            mask: None,
        };
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(17), vxlan.clone()],
                &[RuleAction::Drop],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Item(2),
        );

        // Tunneled rules and VLAN actions cannot combine.
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), vlan(), ipv4(17), udp(), vxlan],
                &[
                    RuleAction::PopVlan,
                    RuleAction::Queue { index: 0 },
                ],
            ),
            ErrorKind::Conflict,
            ErrorCause::Unspecified,
        );
    }

    #[test]
    fn fate_required_on_ingress() {
        assert_err(
            validate(
                &caps(),
                &ingress(),
                &[eth(), ipv4(0)],
                &[RuleAction::Count { shared: false, id: 0 }],
            ),
            ErrorKind::InvalidArgument,
            ErrorCause::Unspecified,
        );

        // Egress-only rules may omit a fate action.
        let egress = RuleAttr { egress: true, ..Default::default() };
        assert!(validate(
            &caps(),
            &egress,
            &[eth(), ipv4(0)],
            &[RuleAction::Count { shared: false, id: 0 }],
        )
        .is_ok());
    }

    #[test]
    fn transfer_restrictions() {
        let caps = RuleDeviceCaps { esw_enabled: true, ..caps() };
        let attr =
            RuleAttr { transfer: true, ingress: true, ..Default::default() };

        assert_err(
            validate(
                &caps,
                &attr,
                &[eth()],
                &[RuleAction::Queue { index: 0 }],
            ),
            ErrorKind::Unsupported,
            ErrorCause::Unspecified,
        );

        assert!(validate(
            &caps,
            &attr,
            &[eth()],
            &[RuleAction::PortId { id: 2, original: false }],
        )
        .is_ok());
    }
}
