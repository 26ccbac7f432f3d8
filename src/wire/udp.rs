//! UDP datagram view (RFC 768).

use errors::{RxError, Validator};
use wire::{Checksum, get_u16, set_u16};

const SRC_PORT_OFF: usize = 0;
const DST_PORT_OFF: usize = 2;
const LENGTH_OFF: usize = 4;
const CHECKSUM_OFF: usize = 6;

pub struct UdpPacket<'a> {
    data: &'a [u8],
}

impl<'a> UdpPacket<'a> {
    pub fn new(data: &'a [u8]) -> Result<UdpPacket<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(UdpPacket { data: data })
    }

    pub fn minimum_packet_size() -> usize {
        8
    }

    pub fn get_source(&self) -> u16 {
        get_u16(self.data, SRC_PORT_OFF)
    }

    pub fn get_destination(&self) -> u16 {
        get_u16(self.data, DST_PORT_OFF)
    }

    /// Length of header plus payload as claimed by the header.
    pub fn get_length(&self) -> u16 {
        get_u16(self.data, LENGTH_OFF)
    }

    pub fn get_checksum(&self) -> u16 {
        get_u16(self.data, CHECKSUM_OFF)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[Self::minimum_packet_size()..self.get_length() as usize]
    }

    /// Computes the datagram checksum. `csum` must already hold the pseudo
    /// header written by the IP layer. The checksum field itself counts as
    /// zero.
    pub fn calculate_checksum(&self, mut csum: Checksum) -> u16 {
        let length = self.get_length() as usize;
        csum.write(&self.data[..CHECKSUM_OFF]);
        csum.write_u16(0);
        csum.write(&self.data[CHECKSUM_OFF + 2..length]);
        let result = csum.finish();
        // An all-zero result is transmitted as all ones (RFC 768).
        if result == 0 {
            0xffff
        } else {
            result
        }
    }

    pub fn validate_size(&self, v: &mut Validator) {
        let length = self.get_length() as usize;
        if length < Self::minimum_packet_size() || length > self.data.len() {
            v.push(RxError::InvalidLengthField);
        }
    }
}

pub struct MutableUdpPacket<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableUdpPacket<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableUdpPacket<'a>, RxError> {
        if data.len() < UdpPacket::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableUdpPacket { data: data })
    }

    pub fn to_immutable(&self) -> UdpPacket {
        UdpPacket { data: self.data }
    }

    pub fn set_source(&mut self, port: u16) {
        set_u16(self.data, SRC_PORT_OFF, port);
    }

    pub fn set_destination(&mut self, port: u16) {
        set_u16(self.data, DST_PORT_OFF, port);
    }

    pub fn set_length(&mut self, length: u16) {
        set_u16(self.data, LENGTH_OFF, length);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        set_u16(self.data, CHECKSUM_OFF, checksum);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[UdpPacket::minimum_packet_size()..]
    }
}
