//! ARP packet view (RFC 826). Hardware and protocol address lengths are
//! taken from the header, so the view works for any address family even
//! though the stack itself only resolves IPv4 over Ethernet.

use errors::{RxError, Validator};
use wire::{get_u16, set_u16};

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

pub const HARDWARE_TYPE_ETHERNET: u16 = 1;

const HTYPE_OFF: usize = 0;
const PTYPE_OFF: usize = 2;
const HLEN_OFF: usize = 4;
const PLEN_OFF: usize = 5;
const OPER_OFF: usize = 6;
const ADDR_OFF: usize = 8;

pub struct ArpPacket<'a> {
    data: &'a [u8],
}

impl<'a> ArpPacket<'a> {
    pub fn new(data: &'a [u8]) -> Result<ArpPacket<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(ArpPacket { data: data })
    }

    /// The fixed part of the header before the variable length addresses.
    pub fn minimum_packet_size() -> usize {
        8
    }

    /// Total packet size for the given address lengths.
    pub fn packet_size(hw_len: u8, proto_len: u8) -> usize {
        Self::minimum_packet_size() + 2 * (hw_len as usize + proto_len as usize)
    }

    pub fn get_hardware_type(&self) -> u16 {
        get_u16(self.data, HTYPE_OFF)
    }

    pub fn get_protocol_type(&self) -> u16 {
        get_u16(self.data, PTYPE_OFF)
    }

    pub fn get_hw_addr_len(&self) -> u8 {
        self.data[HLEN_OFF]
    }

    pub fn get_proto_addr_len(&self) -> u8 {
        self.data[PLEN_OFF]
    }

    pub fn get_operation(&self) -> u16 {
        get_u16(self.data, OPER_OFF)
    }

    pub fn get_sender_hw_addr(&self) -> &[u8] {
        let hlen = self.get_hw_addr_len() as usize;
        &self.data[ADDR_OFF..ADDR_OFF + hlen]
    }

    pub fn get_sender_proto_addr(&self) -> &[u8] {
        let hlen = self.get_hw_addr_len() as usize;
        let plen = self.get_proto_addr_len() as usize;
        &self.data[ADDR_OFF + hlen..ADDR_OFF + hlen + plen]
    }

    pub fn get_target_hw_addr(&self) -> &[u8] {
        let hlen = self.get_hw_addr_len() as usize;
        let plen = self.get_proto_addr_len() as usize;
        let off = ADDR_OFF + hlen + plen;
        &self.data[off..off + hlen]
    }

    pub fn get_target_proto_addr(&self) -> &[u8] {
        let hlen = self.get_hw_addr_len() as usize;
        let plen = self.get_proto_addr_len() as usize;
        let off = ADDR_OFF + 2 * hlen + plen;
        &self.data[off..off + plen]
    }

    pub fn validate_size(&self, v: &mut Validator) {
        let wanted = Self::packet_size(self.get_hw_addr_len(), self.get_proto_addr_len());
        if self.data.len() < wanted {
            v.push(RxError::InvalidLengthField);
        }
    }
}

pub struct MutableArpPacket<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableArpPacket<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableArpPacket<'a>, RxError> {
        if data.len() < ArpPacket::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableArpPacket { data: data })
    }

    pub fn to_immutable(&self) -> ArpPacket {
        ArpPacket { data: self.data }
    }

    pub fn set_hardware_type(&mut self, htype: u16) {
        set_u16(self.data, HTYPE_OFF, htype);
    }

    pub fn set_protocol_type(&mut self, ptype: u16) {
        set_u16(self.data, PTYPE_OFF, ptype);
    }

    pub fn set_hw_addr_len(&mut self, hlen: u8) {
        self.data[HLEN_OFF] = hlen;
    }

    pub fn set_proto_addr_len(&mut self, plen: u8) {
        self.data[PLEN_OFF] = plen;
    }

    pub fn set_operation(&mut self, oper: u16) {
        set_u16(self.data, OPER_OFF, oper);
    }

    /// Writes the sender hardware address. The length fields must have been
    /// set before any of the address setters are used.
    pub fn set_sender_hw_addr(&mut self, addr: &[u8]) {
        let hlen = self.data[HLEN_OFF] as usize;
        assert_eq!(hlen, addr.len());
        self.data[ADDR_OFF..ADDR_OFF + hlen].copy_from_slice(addr);
    }

    pub fn set_sender_proto_addr(&mut self, addr: &[u8]) {
        let hlen = self.data[HLEN_OFF] as usize;
        let plen = self.data[PLEN_OFF] as usize;
        assert_eq!(plen, addr.len());
        self.data[ADDR_OFF + hlen..ADDR_OFF + hlen + plen].copy_from_slice(addr);
    }

    pub fn set_target_hw_addr(&mut self, addr: &[u8]) {
        let hlen = self.data[HLEN_OFF] as usize;
        let plen = self.data[PLEN_OFF] as usize;
        assert_eq!(hlen, addr.len());
        let off = ADDR_OFF + hlen + plen;
        self.data[off..off + hlen].copy_from_slice(addr);
    }

    pub fn set_target_proto_addr(&mut self, addr: &[u8]) {
        let hlen = self.data[HLEN_OFF] as usize;
        let plen = self.data[PLEN_OFF] as usize;
        assert_eq!(plen, addr.len());
        let off = ADDR_OFF + 2 * hlen + plen;
        self.data[off..off + plen].copy_from_slice(addr);
    }
}
