// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Building header-rewrite programs.
//!
//! Every modify action of a rule converts into commands appended to
//! one pending program; the program registers as a single deduplicated
//! resource when the action list ends. Each protocol has a static
//! table carving its header into rewritable hardware fields; a command
//! is emitted for every field whose mask segment is non-zero.

use super::super::device::ModifyCmd;
use super::super::device::ModifyField;
use super::super::device::ModifyOp;
use super::super::device::TableType;
use crate::api::FlowError;

/// The most commands one combined rewrite program may carry.
pub const MODIFY_NUM: usize = 16;

/// The content of a modify-header resource being accumulated.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ModifyHdrSpec {
    pub ft_type: Option<TableType>,
    /// Rule lives in the root table.
    pub root: bool,
    pub cmds: Vec<ModifyCmd>,
}

struct FieldModify {
    /// Field size in bytes, except where a table notes otherwise.
    size: u8,
    /// Offset of the field in the protocol header, in bytes.
    offset: u8,
    field: ModifyField,
}

const MODIFY_ETH: &[FieldModify] = &[
    FieldModify { size: 4, offset: 0, field: ModifyField::OutDmac47_16 },
    FieldModify { size: 2, offset: 4, field: ModifyField::OutDmac15_0 },
    FieldModify { size: 4, offset: 6, field: ModifyField::OutSmac47_16 },
    FieldModify { size: 2, offset: 10, field: ModifyField::OutSmac15_0 },
];

const MODIFY_IPV4: &[FieldModify] = &[
    FieldModify { size: 1, offset: 8, field: ModifyField::OutIpv4Ttl },
    FieldModify { size: 4, offset: 12, field: ModifyField::OutSipv4 },
    FieldModify { size: 4, offset: 16, field: ModifyField::OutDipv4 },
];

const MODIFY_IPV6: &[FieldModify] = &[
    FieldModify { size: 1, offset: 7, field: ModifyField::OutIpv6Hoplimit },
    FieldModify { size: 4, offset: 8, field: ModifyField::OutSipv6_127_96 },
    FieldModify { size: 4, offset: 12, field: ModifyField::OutSipv6_95_64 },
    FieldModify { size: 4, offset: 16, field: ModifyField::OutSipv6_63_32 },
    FieldModify { size: 4, offset: 20, field: ModifyField::OutSipv6_31_0 },
    FieldModify { size: 4, offset: 24, field: ModifyField::OutDipv6_127_96 },
    FieldModify { size: 4, offset: 28, field: ModifyField::OutDipv6_95_64 },
    FieldModify { size: 4, offset: 32, field: ModifyField::OutDipv6_63_32 },
    FieldModify { size: 4, offset: 36, field: ModifyField::OutDipv6_31_0 },
];

const MODIFY_UDP: &[FieldModify] = &[
    FieldModify { size: 2, offset: 0, field: ModifyField::OutUdpSport },
    FieldModify { size: 2, offset: 2, field: ModifyField::OutUdpDport },
];

const MODIFY_TCP: &[FieldModify] = &[
    FieldModify { size: 2, offset: 0, field: ModifyField::OutTcpSport },
    FieldModify { size: 2, offset: 2, field: ModifyField::OutTcpDport },
    FieldModify { size: 4, offset: 4, field: ModifyField::OutTcpSeqNum },
    FieldModify { size: 4, offset: 8, field: ModifyField::OutTcpAckNum },
];

/// Walk a field table over a (spec, mask) header image and emit one
/// command per non-zero mask segment.
fn convert(
    res: &mut ModifyHdrSpec,
    spec: &[u8],
    mask: &[u8],
    table: &[FieldModify],
    op: ModifyOp,
) -> Result<(), FlowError> {
    for fm in table {
        let size = usize::from(fm.size);
        let offset = usize::from(fm.offset);
        if mask[offset..offset + size].iter().all(|b| *b == 0) {
            continue;
        }

        if res.cmds.len() >= MODIFY_NUM {
            return Err(FlowError::exhausted("too many fields to modify"));
        }

        let mut data = [0u8; 4];
        data[4 - size..].copy_from_slice(&spec[offset..offset + size]);
        res.cmds.push(ModifyCmd {
            op,
            field: fm.field,
            length: if size == 4 { 0 } else { fm.size * 8 },
            data,
        });
    }

    if res.cmds.is_empty() {
        return Err(FlowError::invalid("modify action changes nothing"));
    }

    Ok(())
}

pub fn convert_mac(
    res: &mut ModifyHdrSpec,
    mac: [u8; 6],
    dst: bool,
) -> Result<(), FlowError> {
    let mut spec = [0u8; 12];
    let mut mask = [0u8; 12];
    let base = if dst { 0 } else { 6 };
    spec[base..base + 6].copy_from_slice(&mac);
    mask[base..base + 6].fill(0xff);
    convert(res, &spec, &mask, MODIFY_ETH, ModifyOp::Set)
}

pub fn convert_ipv4_addr(
    res: &mut ModifyHdrSpec,
    addr: u32,
    dst: bool,
) -> Result<(), FlowError> {
    let mut spec = [0u8; 20];
    let mut mask = [0u8; 20];
    let base = if dst { 16 } else { 12 };
    spec[base..base + 4].copy_from_slice(&addr.to_be_bytes());
    mask[base..base + 4].fill(0xff);
    convert(res, &spec, &mask, MODIFY_IPV4, ModifyOp::Set)
}

pub fn convert_ipv6_addr(
    res: &mut ModifyHdrSpec,
    addr: [u8; 16],
    dst: bool,
) -> Result<(), FlowError> {
    let mut spec = [0u8; 40];
    let mut mask = [0u8; 40];
    let base = if dst { 24 } else { 8 };
    spec[base..base + 16].copy_from_slice(&addr);
    mask[base..base + 16].fill(0xff);
    convert(res, &spec, &mask, MODIFY_IPV6, ModifyOp::Set)
}

/// Rewrite a transport-layer port. Which table applies depends on the
/// L4 protocol the rule's pattern matched.
pub fn convert_tp(
    res: &mut ModifyHdrSpec,
    port: u16,
    dst: bool,
    udp: bool,
) -> Result<(), FlowError> {
    let mut spec = [0u8; 12];
    let mut mask = [0u8; 12];
    let base = if dst { 2 } else { 0 };
    spec[base..base + 2].copy_from_slice(&port.to_be_bytes());
    mask[base..base + 2].fill(0xff);
    let table = if udp { MODIFY_UDP } else { MODIFY_TCP };
    convert(res, &spec, &mask, table, ModifyOp::Set)
}

/// Set the IP TTL/hop-limit; the table depends on the pattern's L3
/// version.
pub fn convert_ttl(
    res: &mut ModifyHdrSpec,
    ttl: u8,
    ipv6: bool,
) -> Result<(), FlowError> {
    if ipv6 {
        let mut spec = [0u8; 40];
        let mut mask = [0u8; 40];
        spec[7] = ttl;
        mask[7] = 0xff;
        convert(res, &spec, &mask, MODIFY_IPV6, ModifyOp::Set)
    } else {
        let mut spec = [0u8; 20];
        let mut mask = [0u8; 20];
        spec[8] = ttl;
        mask[8] = 0xff;
        convert(res, &spec, &mask, MODIFY_IPV4, ModifyOp::Set)
    }
}

/// Decrement the IP TTL/hop-limit by adding -1.
pub fn convert_dec_ttl(
    res: &mut ModifyHdrSpec,
    ipv6: bool,
) -> Result<(), FlowError> {
    convert_ttl_op(res, 0xff, ipv6)
}

fn convert_ttl_op(
    res: &mut ModifyHdrSpec,
    val: u8,
    ipv6: bool,
) -> Result<(), FlowError> {
    if ipv6 {
        let mut spec = [0u8; 40];
        let mut mask = [0u8; 40];
        spec[7] = val;
        mask[7] = 0xff;
        convert(res, &spec, &mask, MODIFY_IPV6, ModifyOp::Add)
    } else {
        let mut spec = [0u8; 20];
        let mut mask = [0u8; 20];
        spec[8] = val;
        mask[8] = 0xff;
        convert(res, &spec, &mask, MODIFY_IPV4, ModifyOp::Add)
    }
}

/// Add a delta to the TCP sequence or acknowledgment number;
/// decrements pass the two's complement.
pub fn convert_tcp_adjust(
    res: &mut ModifyHdrSpec,
    delta: u32,
    decrease: bool,
    ack: bool,
) -> Result<(), FlowError> {
    let value = if decrease { delta.wrapping_neg() } else { delta };
    let mut spec = [0u8; 12];
    let mut mask = [0u8; 12];
    let base = if ack { 8 } else { 4 };
    spec[base..base + 4].copy_from_slice(&value.to_be_bytes());
    mask[base..base + 4].fill(0xff);
    convert(res, &spec, &mask, MODIFY_TCP, ModifyOp::Add)
}

/// Rewrite the VID of an existing outer VLAN header. The field is 12
/// bits wide, not byte-aligned, so it bypasses the table walk.
pub fn convert_vlan_vid(
    res: &mut ModifyHdrSpec,
    vid: u16,
) -> Result<(), FlowError> {
    if res.cmds.len() >= MODIFY_NUM {
        return Err(FlowError::exhausted("too many fields to modify"));
    }

    let mut data = [0u8; 4];
    data[2..].copy_from_slice(&(vid & 0x0fff).to_be_bytes());
    res.cmds.push(ModifyCmd {
        op: ModifyOp::Set,
        field: ModifyField::OutFirstVid,
        length: 12,
        data,
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mac_rewrite_splits_fields() {
        let mut res = ModifyHdrSpec::default();
        convert_mac(&mut res, [2, 0, 0, 0, 0, 1], false).unwrap();

        // A MAC spans a 32-bit and a 16-bit hardware field.
        assert_eq!(res.cmds.len(), 2);
        assert_eq!(res.cmds[0].field, ModifyField::OutSmac47_16);
        assert_eq!(res.cmds[0].length, 0);
        assert_eq!(res.cmds[0].data, [2, 0, 0, 0]);
        assert_eq!(res.cmds[1].field, ModifyField::OutSmac15_0);
        assert_eq!(res.cmds[1].length, 16);
        assert_eq!(res.cmds[1].data, [0, 0, 0, 1]);
    }

    #[test]
    fn programs_accumulate() {
        let mut res = ModifyHdrSpec::default();
        convert_ipv4_addr(&mut res, 0x0a000001, false).unwrap();
        convert_ipv4_addr(&mut res, 0x0a000002, true).unwrap();
        convert_tp(&mut res, 8080, true, true).unwrap();

        assert_eq!(res.cmds.len(), 3);
        assert_eq!(res.cmds[0].field, ModifyField::OutSipv4);
        assert_eq!(res.cmds[1].field, ModifyField::OutDipv4);
        assert_eq!(res.cmds[2].field, ModifyField::OutUdpDport);
    }

    #[test]
    fn dec_ttl_is_add_minus_one() {
        let mut res = ModifyHdrSpec::default();
        convert_dec_ttl(&mut res, false).unwrap();
        assert_eq!(res.cmds[0].op, ModifyOp::Add);
        assert_eq!(res.cmds[0].field, ModifyField::OutIpv4Ttl);
        assert_eq!(res.cmds[0].data, [0, 0, 0, 0xff]);
    }

    #[test]
    fn tcp_decrease_negates() {
        let mut res = ModifyHdrSpec::default();
        convert_tcp_adjust(&mut res, 1000, true, false).unwrap();
        assert_eq!(res.cmds[0].op, ModifyOp::Add);
        assert_eq!(
            u32::from_be_bytes(res.cmds[0].data),
            1000u32.wrapping_neg()
        );
    }

    #[test]
    fn command_cap_enforced() {
        let mut res = ModifyHdrSpec::default();
        for i in 0..MODIFY_NUM {
            convert_vlan_vid(&mut res, i as u16).unwrap();
        }
        let err = convert_vlan_vid(&mut res, 1).unwrap_err();
        assert_eq!(err.kind, crate::api::ErrorKind::ResourceExhausted);
    }
}
