//! Ethernet II frame view, with optional 802.1Q VLAN tag.

use errors::{RxError, Validator};
use wire::{MacAddr, get_u16, set_u16};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// EtherType values below this are 802.3 length fields, not protocols.
pub const ETHERTYPE_MIN: u16 = 0x0600;

const DST_OFF: usize = 0;
const SRC_OFF: usize = 6;
const TYPE_OFF: usize = 12;
const VLAN_TCI_OFF: usize = 14;
const VLAN_TYPE_OFF: usize = 16;

pub struct EthernetFrame<'a> {
    data: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub fn new(data: &'a [u8]) -> Result<EthernetFrame<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(EthernetFrame { data: data })
    }

    pub fn minimum_packet_size() -> usize {
        14
    }

    pub fn get_destination(&self) -> MacAddr {
        MacAddr::from_slice(&self.data[DST_OFF..DST_OFF + 6])
    }

    pub fn get_source(&self) -> MacAddr {
        MacAddr::from_slice(&self.data[SRC_OFF..SRC_OFF + 6])
    }

    /// The raw 16 bit type/length field at offset 12. For VLAN tagged
    /// frames this is `ETHERTYPE_VLAN`; use `get_ethertype` to look through
    /// the tag.
    pub fn get_raw_type(&self) -> u16 {
        get_u16(self.data, TYPE_OFF)
    }

    /// The EtherType of the payload, looking through a VLAN tag if one is
    /// present.
    pub fn get_ethertype(&self) -> u16 {
        if self.is_vlan_tagged() && self.data.len() >= VLAN_TYPE_OFF + 2 {
            get_u16(self.data, VLAN_TYPE_OFF)
        } else {
            get_u16(self.data, TYPE_OFF)
        }
    }

    /// True when the type/length field holds an 802.3 length instead of an
    /// EtherType.
    pub fn is_length_field(&self) -> bool {
        self.get_raw_type() < ETHERTYPE_MIN
    }

    pub fn is_vlan_tagged(&self) -> bool {
        self.get_raw_type() == ETHERTYPE_VLAN
    }

    /// The VLAN tag control information, if the frame carries a tag.
    pub fn get_vlan_tci(&self) -> Option<u16> {
        if self.is_vlan_tagged() && self.data.len() >= VLAN_TCI_OFF + 2 {
            Some(get_u16(self.data, VLAN_TCI_OFF))
        } else {
            None
        }
    }

    /// Header length in bytes, 14 or 18 depending on the VLAN tag.
    pub fn header_len(&self) -> usize {
        if self.is_vlan_tagged() {
            18
        } else {
            14
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.get_destination().is_broadcast()
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len()..]
    }

    pub fn validate_size(&self, v: &mut Validator) {
        if self.is_vlan_tagged() && self.data.len() < 18 {
            v.push(RxError::ShortBuffer);
        }
        if self.is_length_field() {
            let length = self.get_raw_type() as usize;
            if length > self.data.len() - self.header_len() {
                v.push(RxError::InvalidLengthField);
            }
        }
    }
}

pub struct MutableEthernetFrame<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableEthernetFrame<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableEthernetFrame<'a>, RxError> {
        if data.len() < EthernetFrame::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableEthernetFrame { data: data })
    }

    pub fn to_immutable(&self) -> EthernetFrame {
        EthernetFrame { data: self.data }
    }

    pub fn set_destination(&mut self, mac: MacAddr) {
        self.data[DST_OFF..DST_OFF + 6].copy_from_slice(&mac.octets());
    }

    pub fn get_destination(&self) -> MacAddr {
        MacAddr::from_slice(&self.data[DST_OFF..DST_OFF + 6])
    }

    pub fn set_source(&mut self, mac: MacAddr) {
        self.data[SRC_OFF..SRC_OFF + 6].copy_from_slice(&mac.octets());
    }

    pub fn set_ethertype(&mut self, ethertype: u16) {
        set_u16(self.data, TYPE_OFF, ethertype);
    }

    /// Inserts an 802.1Q tag header. The caller must have laid out the
    /// frame with the 18 byte header in mind, the payload is not moved.
    pub fn set_vlan_tag(&mut self, tci: u16, inner_ethertype: u16) {
        assert!(self.data.len() >= 18);
        set_u16(self.data, TYPE_OFF, ETHERTYPE_VLAN);
        set_u16(self.data, VLAN_TCI_OFF, tci);
        set_u16(self.data, VLAN_TYPE_OFF, inner_ethertype);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.to_immutable().header_len();
        &mut self.data[header_len..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::{RxError, Validator};
    use wire::MacAddr;

    #[test]
    fn too_short_buffer() {
        let buf = [0u8; 13];
        assert!(EthernetFrame::new(&buf).is_err());
    }

    #[test]
    fn read_after_write() {
        let mut buf = [0u8; 20];
        {
            let mut frame = MutableEthernetFrame::new(&mut buf).unwrap();
            frame.set_destination(MacAddr::new(1, 2, 3, 4, 5, 6));
            frame.set_source(MacAddr::new(6, 5, 4, 3, 2, 1));
            frame.set_ethertype(ETHERTYPE_IPV4);
        }
        let frame = EthernetFrame::new(&buf).unwrap();
        assert_eq!(MacAddr::new(1, 2, 3, 4, 5, 6), frame.get_destination());
        assert_eq!(MacAddr::new(6, 5, 4, 3, 2, 1), frame.get_source());
        assert_eq!(ETHERTYPE_IPV4, frame.get_ethertype());
        assert!(!frame.is_vlan_tagged());
        assert_eq!(14, frame.header_len());
        assert_eq!(6, frame.payload().len());
    }

    #[test]
    fn vlan_tag() {
        let mut buf = [0u8; 18];
        {
            let mut frame = MutableEthernetFrame::new(&mut buf).unwrap();
            frame.set_vlan_tag(0x0123, ETHERTYPE_ARP);
        }
        let frame = EthernetFrame::new(&buf).unwrap();
        assert!(frame.is_vlan_tagged());
        assert_eq!(Some(0x0123), frame.get_vlan_tci());
        assert_eq!(ETHERTYPE_ARP, frame.get_ethertype());
        assert_eq!(18, frame.header_len());
    }

    #[test]
    fn vlan_tag_needs_room() {
        let mut buf = [0u8; 14];
        buf[12] = 0x81;
        buf[13] = 0x00;
        let frame = EthernetFrame::new(&buf).unwrap();
        let mut v = Validator::new();
        frame.validate_size(&mut v);
        assert_eq!(Err(RxError::ShortBuffer), v.result());
    }

    #[test]
    fn broadcast_detection() {
        let mut buf = [0u8; 14];
        {
            let mut frame = MutableEthernetFrame::new(&mut buf).unwrap();
            frame.set_destination(MacAddr::broadcast());
        }
        assert!(EthernetFrame::new(&buf).unwrap().is_broadcast());
    }
}
