// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Accumulating "seen so far" bitmasks carried through rule
//! validation and translation.

use bitflags::bitflags;

/// The hard cap on compiled actions per rule.
pub const MAX_ACTIONS: usize = 8;

bitflags! {
    /// Pattern layers seen while walking a rule's item list.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ItemFlags: u64 {
        const OUTER_L2 = 1 << 0;
        const OUTER_VLAN = 1 << 1;
        const OUTER_L3_IPV4 = 1 << 2;
        const OUTER_L3_IPV6 = 1 << 3;
        const OUTER_L4_TCP = 1 << 4;
        const OUTER_L4_UDP = 1 << 5;
        const INNER_L2 = 1 << 6;
        const INNER_VLAN = 1 << 7;
        const INNER_L3_IPV4 = 1 << 8;
        const INNER_L3_IPV6 = 1 << 9;
        const INNER_L4_TCP = 1 << 10;
        const INNER_L4_UDP = 1 << 11;
        const GRE = 1 << 12;
        const GRE_KEY = 1 << 13;
        const VXLAN = 1 << 14;
        const IPIP = 1 << 15;
        const IPV6_ENCAP = 1 << 16;
        const ICMP = 1 << 17;
        const ICMP6 = 1 << 18;
        const META = 1 << 19;
        const PORT_ID = 1 << 20;
    }
}

impl ItemFlags {
    pub const OUTER_L3: ItemFlags =
        ItemFlags::OUTER_L3_IPV4.union(ItemFlags::OUTER_L3_IPV6);
    pub const INNER_L3: ItemFlags =
        ItemFlags::INNER_L3_IPV4.union(ItemFlags::INNER_L3_IPV6);
    pub const L3: ItemFlags = ItemFlags::OUTER_L3.union(ItemFlags::INNER_L3);
    pub const L3_IPV4: ItemFlags =
        ItemFlags::OUTER_L3_IPV4.union(ItemFlags::INNER_L3_IPV4);
    pub const L3_IPV6: ItemFlags =
        ItemFlags::OUTER_L3_IPV6.union(ItemFlags::INNER_L3_IPV6);
    pub const OUTER_L4: ItemFlags =
        ItemFlags::OUTER_L4_TCP.union(ItemFlags::OUTER_L4_UDP);
    pub const INNER_L4: ItemFlags =
        ItemFlags::INNER_L4_TCP.union(ItemFlags::INNER_L4_UDP);
    pub const L4: ItemFlags = ItemFlags::OUTER_L4.union(ItemFlags::INNER_L4);
    pub const L2: ItemFlags =
        ItemFlags::OUTER_L2.union(ItemFlags::INNER_L2);
    pub const TUNNEL: ItemFlags = ItemFlags::GRE
        .union(ItemFlags::VXLAN)
        .union(ItemFlags::IPIP)
        .union(ItemFlags::IPV6_ENCAP);
}

bitflags! {
    /// Actions seen while walking a rule's action list.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ActionFlags: u64 {
        const DROP = 1 << 0;
        const QUEUE = 1 << 1;
        const RSS = 1 << 2;
        const COUNT = 1 << 3;
        const FLAG = 1 << 4;
        const MARK = 1 << 5;
        const JUMP = 1 << 6;
        const PORT_ID = 1 << 7;
        const OF_POP_VLAN = 1 << 8;
        const OF_PUSH_VLAN = 1 << 9;
        const OF_SET_VLAN_VID = 1 << 10;
        const RAW_ENCAP = 1 << 11;
        const RAW_DECAP = 1 << 12;
        const TUNNEL_ENCAP = 1 << 13;
        const TUNNEL_DECAP = 1 << 14;
        const SET_MAC_SRC = 1 << 15;
        const SET_MAC_DST = 1 << 16;
        const SET_IPV4_SRC = 1 << 17;
        const SET_IPV4_DST = 1 << 18;
        const SET_IPV6_SRC = 1 << 19;
        const SET_IPV6_DST = 1 << 20;
        const SET_TP_SRC = 1 << 21;
        const SET_TP_DST = 1 << 22;
        const SET_TTL = 1 << 23;
        const DEC_TTL = 1 << 24;
        const INC_TCP_SEQ = 1 << 25;
        const DEC_TCP_SEQ = 1 << 26;
        const INC_TCP_ACK = 1 << 27;
        const DEC_TCP_ACK = 1 << 28;
    }
}

impl ActionFlags {
    /// At most one of these decides a packet's fate in a non-transfer
    /// rule.
    pub const FATE: ActionFlags = ActionFlags::DROP
        .union(ActionFlags::QUEUE)
        .union(ActionFlags::RSS)
        .union(ActionFlags::JUMP);

    /// Fate actions available to transfer rules.
    pub const FATE_ESWITCH: ActionFlags = ActionFlags::DROP
        .union(ActionFlags::PORT_ID)
        .union(ActionFlags::JUMP);

    pub const ENCAP: ActionFlags =
        ActionFlags::RAW_ENCAP.union(ActionFlags::TUNNEL_ENCAP);

    pub const DECAP: ActionFlags =
        ActionFlags::RAW_DECAP.union(ActionFlags::TUNNEL_DECAP);

    pub const VLAN: ActionFlags =
        ActionFlags::OF_POP_VLAN.union(ActionFlags::OF_PUSH_VLAN);

    /// Everything folded into one combined modify-header program.
    pub const MODIFY_HDR: ActionFlags = ActionFlags::SET_MAC_SRC
        .union(ActionFlags::SET_MAC_DST)
        .union(ActionFlags::SET_IPV4_SRC)
        .union(ActionFlags::SET_IPV4_DST)
        .union(ActionFlags::SET_IPV6_SRC)
        .union(ActionFlags::SET_IPV6_DST)
        .union(ActionFlags::SET_TP_SRC)
        .union(ActionFlags::SET_TP_DST)
        .union(ActionFlags::SET_TTL)
        .union(ActionFlags::DEC_TTL)
        .union(ActionFlags::INC_TCP_SEQ)
        .union(ActionFlags::DEC_TCP_SEQ)
        .union(ActionFlags::INC_TCP_ACK)
        .union(ActionFlags::DEC_TCP_ACK)
        .union(ActionFlags::OF_SET_VLAN_VID);
}
