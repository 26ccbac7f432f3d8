//! IPv6 header view (RFC 8200). The stack only receives IPv6, it never
//! composes it, but the mutable view exists for tests and future use.

use errors::{RxError, Validator};
use std::net::Ipv6Addr;
use wire::{Checksum, get_u16, get_u32, set_u16, set_u32};

const VERSION_TC_FLOW_OFF: usize = 0;
const PAYLOAD_LEN_OFF: usize = 4;
const NEXT_HEADER_OFF: usize = 6;
const HOP_LIMIT_OFF: usize = 7;
const SRC_OFF: usize = 8;
const DST_OFF: usize = 24;

pub struct Ipv6Packet<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub fn new(data: &'a [u8]) -> Result<Ipv6Packet<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(Ipv6Packet { data: data })
    }

    pub fn minimum_packet_size() -> usize {
        40
    }

    pub fn get_version(&self) -> u8 {
        self.data[VERSION_TC_FLOW_OFF] >> 4
    }

    pub fn get_traffic_class(&self) -> u8 {
        let word = get_u16(self.data, VERSION_TC_FLOW_OFF);
        ((word >> 4) & 0xff) as u8
    }

    pub fn get_flow_label(&self) -> u32 {
        get_u32(self.data, VERSION_TC_FLOW_OFF) & 0x000f_ffff
    }

    pub fn get_payload_length(&self) -> u16 {
        get_u16(self.data, PAYLOAD_LEN_OFF)
    }

    pub fn get_next_header(&self) -> u8 {
        self.data[NEXT_HEADER_OFF]
    }

    pub fn get_hop_limit(&self) -> u8 {
        self.data[HOP_LIMIT_OFF]
    }

    pub fn get_source(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[SRC_OFF..SRC_OFF + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn get_destination(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[DST_OFF..DST_OFF + 16]);
        Ipv6Addr::from(octets)
    }

    pub fn payload(&self) -> &[u8] {
        let end = Self::minimum_packet_size() + self.get_payload_length() as usize;
        &self.data[Self::minimum_packet_size()..end]
    }

    /// Writes the upper-layer pseudo header of RFC 8200 §8.1 into `csum`.
    pub fn checksum_write_pseudo(&self, csum: &mut Checksum, next_header: u8) {
        csum.write_ipv6_pseudo(self.get_source(),
                               self.get_destination(),
                               next_header,
                               self.get_payload_length() as u32);
    }

    pub fn validate_size(&self, v: &mut Validator) {
        let wanted = Self::minimum_packet_size() + self.get_payload_length() as usize;
        if self.data.len() < wanted {
            v.push(RxError::InvalidLengthField);
        }
    }
}

pub struct MutableIpv6Packet<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableIpv6Packet<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableIpv6Packet<'a>, RxError> {
        if data.len() < Ipv6Packet::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableIpv6Packet { data: data })
    }

    pub fn to_immutable(&self) -> Ipv6Packet {
        Ipv6Packet { data: self.data }
    }

    pub fn set_version(&mut self, version: u8) {
        self.data[VERSION_TC_FLOW_OFF] =
            (self.data[VERSION_TC_FLOW_OFF] & 0x0f) | (version << 4);
    }

    pub fn set_traffic_class(&mut self, tc: u8) {
        self.data[0] = (self.data[0] & 0xf0) | (tc >> 4);
        self.data[1] = (self.data[1] & 0x0f) | ((tc & 0x0f) << 4);
    }

    pub fn set_flow_label(&mut self, label: u32) {
        let existing = get_u32(self.data, VERSION_TC_FLOW_OFF) & 0xfff0_0000;
        set_u32(self.data,
                VERSION_TC_FLOW_OFF,
                existing | (label & 0x000f_ffff));
    }

    pub fn set_payload_length(&mut self, length: u16) {
        set_u16(self.data, PAYLOAD_LEN_OFF, length);
    }

    pub fn set_next_header(&mut self, next_header: u8) {
        self.data[NEXT_HEADER_OFF] = next_header;
    }

    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.data[HOP_LIMIT_OFF] = hop_limit;
    }

    pub fn set_source(&mut self, addr: Ipv6Addr) {
        self.data[SRC_OFF..SRC_OFF + 16].copy_from_slice(&addr.octets());
    }

    pub fn set_destination(&mut self, addr: Ipv6Addr) {
        self.data[DST_OFF..DST_OFF + 16].copy_from_slice(&addr.octets());
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[Ipv6Packet::minimum_packet_size()..]
    }
}
