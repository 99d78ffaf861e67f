// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow-rule description: attributes, pattern items, and actions.
//!
//! A rule is admitted by the validator and then compiled by the
//! translator; these types are the wire-neutral description both
//! consume. Pattern items carry a spec and an optional mask; a missing
//! mask means the item's default mask (every field the spec sets,
//! matched in full).

use serde::Deserialize;
use serde::Serialize;

/// Length of an RSS hash key, in bytes.
pub const RSS_HASH_KEY_LEN: usize = 40;

/// A rule priority the engine resolves to the device's lowest
/// priority.
pub const PRIORITY_ANY: u32 = u32::MAX;

/// Where a rule attaches and how it competes with its neighbors.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleAttr {
    pub group: u32,
    pub priority: u32,
    pub ingress: bool,
    pub egress: bool,
    /// Match and steer between switch ports rather than within one
    /// port. Requires switching capability and a privileged role.
    pub transfer: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EthHdr {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

impl EthHdr {
    pub const FULL_MASK: Self = Self {
        dst: [0xff; 6],
        src: [0xff; 6],
        ether_type: 0xffff,
    };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VlanHdr {
    /// PCP | DEI | VID, host order.
    pub tci: u16,
    pub inner_type: u16,
}

impl VlanHdr {
    pub const FULL_MASK: Self = Self { tci: 0xffff, inner_type: 0xffff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv4Hdr {
    pub src: u32,
    pub dst: u32,
    pub proto: u8,
    pub dscp: u8,
    pub ttl: u8,
}

impl Ipv4Hdr {
    pub const FULL_MASK: Self = Self {
        src: u32::MAX,
        dst: u32::MAX,
        proto: 0xff,
        dscp: 0x3f,
        ttl: 0xff,
    };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv6Hdr {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub proto: u8,
}

impl Ipv6Hdr {
    pub const FULL_MASK: Self =
        Self { src: [0xff; 16], dst: [0xff; 16], proto: 0xff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TcpHdr {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
}

impl TcpHdr {
    pub const FULL_MASK: Self =
        Self { src_port: 0xffff, dst_port: 0xffff, flags: 0xff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UdpHdr {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHdr {
    pub const FULL_MASK: Self = Self { src_port: 0xffff, dst_port: 0xffff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GreHdr {
    pub protocol: u16,
}

impl GreHdr {
    pub const FULL_MASK: Self = Self { protocol: 0xffff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VxlanHdr {
    /// 24-bit VNI in the low bits.
    pub vni: u32,
}

impl VxlanHdr {
    pub const FULL_MASK: Self = Self { vni: 0x00ff_ffff };
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct IcmpHdr {
    pub icmp_type: u8,
    pub code: u8,
}

impl IcmpHdr {
    pub const FULL_MASK: Self = Self { icmp_type: 0xff, code: 0xff };
}

/// One layer of the pattern a rule matches. `spec` carries the values,
/// `mask` selects the bits that participate; `None` means the item's
/// default (full) mask.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum RuleItem {
    Eth { spec: EthHdr, mask: Option<EthHdr> },
    Vlan { spec: VlanHdr, mask: Option<VlanHdr> },
    Ipv4 { spec: Ipv4Hdr, mask: Option<Ipv4Hdr> },
    Ipv6 { spec: Ipv6Hdr, mask: Option<Ipv6Hdr> },
    Tcp { spec: TcpHdr, mask: Option<TcpHdr> },
    Udp { spec: UdpHdr, mask: Option<UdpHdr> },
    Gre { spec: GreHdr, mask: Option<GreHdr> },
    GreKey { spec: u32, mask: Option<u32> },
    Vxlan { spec: VxlanHdr, mask: Option<VxlanHdr> },
    Icmp { spec: IcmpHdr, mask: Option<IcmpHdr> },
    Icmp6 { spec: IcmpHdr, mask: Option<IcmpHdr> },
    /// Software metadata attached on transmit.
    Meta { data: u32, mask: Option<u32> },
    /// Source switch port; transfer rules only.
    PortId { id: u16 },
}

impl RuleItem {
    pub fn name(&self) -> &'static str {
        use RuleItem::*;

        match self {
            Eth { .. } => "eth",
            Vlan { .. } => "vlan",
            Ipv4 { .. } => "ipv4",
            Ipv6 { .. } => "ipv6",
            Tcp { .. } => "tcp",
            Udp { .. } => "udp",
            Gre { .. } => "gre",
            GreKey { .. } => "gre_key",
            Vxlan { .. } => "vxlan",
            Icmp { .. } => "icmp",
            Icmp6 { .. } => "icmp6",
            Meta { .. } => "meta",
            PortId { .. } => "port_id",
        }
    }
}

/// Hash-type bits for [`RssSpec::types`].
pub mod rss_types {
    pub const IPV4: u64 = 1 << 0;
    pub const IPV6: u64 = 1 << 1;
    pub const TCP: u64 = 1 << 2;
    pub const UDP: u64 = 1 << 3;
    /// The default when a rule leaves the type mask at zero.
    pub const IP: u64 = IPV4 | IPV6;
}

/// The spread of queues an RSS fate action hashes across.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RssSpec {
    pub queues: Vec<u16>,
    /// Hash-type bitmask; zero selects the device default.
    pub types: u64,
    /// Encapsulation level the hash is computed over.
    pub level: u32,
    /// Exactly [`RSS_HASH_KEY_LEN`] bytes; `None` selects the
    /// device's default key.
    pub key: Option<Vec<u8>>,
}

/// One action of a rule. Order matters: the validator enforces the
/// cross-action rules and the translator preserves list order in the
/// compiled action set.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum RuleAction {
    Drop,
    Queue { index: u16 },
    Rss(RssSpec),
    /// Attach a flow counter. A `shared` counter with the same `id` is
    /// reused across rules.
    Count { shared: bool, id: u32 },
    /// Mark matched packets with the default mark value.
    Flag,
    /// Mark matched packets with `id`.
    Mark { id: u32 },
    Jump { group: u32 },
    /// Redirect to another switch port; transfer rules only.
    PortId { id: u16, original: bool },
    PopVlan,
    PushVlan { ether_type: u16 },
    SetVlanVid { vid: u16 },
    SetVlanPcp { pcp: u8 },
    /// Prepend caller-provided header bytes.
    RawEncap { data: Vec<u8> },
    RawDecap,
    /// Encapsulate with a tunnel header built from a pattern-item
    /// description (eth [vlan] ipv4/ipv6 udp vxlan).
    TunnelEncap { items: Vec<RuleItem> },
    TunnelDecap,
    SetMacSrc([u8; 6]),
    SetMacDst([u8; 6]),
    SetIpv4Src(u32),
    SetIpv4Dst(u32),
    SetIpv6Src([u8; 16]),
    SetIpv6Dst([u8; 16]),
    SetTpSrc(u16),
    SetTpDst(u16),
    SetTtl(u8),
    DecTtl,
    IncTcpSeq(u32),
    DecTcpSeq(u32),
    IncTcpAck(u32),
    DecTcpAck(u32),
}

impl RuleAction {
    pub fn name(&self) -> &'static str {
        use RuleAction::*;

        match self {
            Drop => "drop",
            Queue { .. } => "queue",
            Rss(_) => "rss",
            Count { .. } => "count",
            Flag => "flag",
            Mark { .. } => "mark",
            Jump { .. } => "jump",
            PortId { .. } => "port_id",
            PopVlan => "pop_vlan",
            PushVlan { .. } => "push_vlan",
            SetVlanVid { .. } => "set_vlan_vid",
            SetVlanPcp { .. } => "set_vlan_pcp",
            RawEncap { .. } => "raw_encap",
            RawDecap => "raw_decap",
            TunnelEncap { .. } => "tunnel_encap",
            TunnelDecap => "tunnel_decap",
            SetMacSrc(_) => "set_mac_src",
            SetMacDst(_) => "set_mac_dst",
            SetIpv4Src(_) => "set_ipv4_src",
            SetIpv4Dst(_) => "set_ipv4_dst",
            SetIpv6Src(_) => "set_ipv6_src",
            SetIpv6Dst(_) => "set_ipv6_dst",
            SetTpSrc(_) => "set_tp_src",
            SetTpDst(_) => "set_tp_dst",
            SetTtl(_) => "set_ttl",
            DecTtl => "dec_ttl",
            IncTcpSeq(_) => "inc_tcp_seq",
            DecTcpSeq(_) => "dec_tcp_seq",
            IncTcpAck(_) => "inc_tcp_ack",
            DecTcpAck(_) => "dec_tcp_ack",
        }
    }
}

/// The result of a counter query.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CounterQuery {
    pub hits: u64,
    pub bytes: u64,
}
