//! TCP segment view (RFC 9293).

use errors::{RxError, Validator};
use wire::{Checksum, get_u16, get_u32, set_u16, set_u32};

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;
pub const FLAG_URG: u8 = 0x20;
pub const FLAG_ECE: u8 = 0x40;
pub const FLAG_CWR: u8 = 0x80;

pub const OPTION_END: u8 = 0;
pub const OPTION_NOP: u8 = 1;
pub const OPTION_MSS: u8 = 2;
pub const OPTION_WINDOW_SCALE: u8 = 3;
pub const OPTION_SACK_PERMITTED: u8 = 4;
pub const OPTION_SACK: u8 = 5;
pub const OPTION_TIMESTAMPS: u8 = 8;

const SRC_PORT_OFF: usize = 0;
const DST_PORT_OFF: usize = 2;
const SEQ_OFF: usize = 4;
const ACK_OFF: usize = 8;
const DATA_OFF_OFF: usize = 12;
const FLAGS_OFF: usize = 13;
const WINDOW_OFF: usize = 14;
const CHECKSUM_OFF: usize = 16;
const URGENT_OFF: usize = 18;
const OPTIONS_OFF: usize = 20;

pub struct TcpPacket<'a> {
    data: &'a [u8],
}

impl<'a> TcpPacket<'a> {
    pub fn new(data: &'a [u8]) -> Result<TcpPacket<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(TcpPacket { data: data })
    }

    pub fn minimum_packet_size() -> usize {
        20
    }

    pub fn get_source(&self) -> u16 {
        get_u16(self.data, SRC_PORT_OFF)
    }

    pub fn get_destination(&self) -> u16 {
        get_u16(self.data, DST_PORT_OFF)
    }

    pub fn get_sequence(&self) -> u32 {
        get_u32(self.data, SEQ_OFF)
    }

    pub fn get_acknowledgement(&self) -> u32 {
        get_u32(self.data, ACK_OFF)
    }

    /// Header length in 32 bit words.
    pub fn get_data_offset(&self) -> u8 {
        self.data[DATA_OFF_OFF] >> 4
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.get_data_offset() as usize * 4
    }

    pub fn get_flags(&self) -> u8 {
        self.data[FLAGS_OFF]
    }

    pub fn get_window(&self) -> u16 {
        get_u16(self.data, WINDOW_OFF)
    }

    pub fn get_checksum(&self) -> u16 {
        get_u16(self.data, CHECKSUM_OFF)
    }

    pub fn get_urgent_pointer(&self) -> u16 {
        get_u16(self.data, URGENT_OFF)
    }

    pub fn options(&self) -> &[u8] {
        &self.data[OPTIONS_OFF..self.header_len()]
    }

    /// Iterates the options between the fixed header and the payload. NOPs
    /// are skipped, iteration stops at an end-of-options kind or a
    /// malformed length.
    pub fn options_iter(&self) -> TcpOptionsIter {
        TcpOptionsIter {
            data: self.options(),
            pos: 0,
        }
    }

    /// The maximum segment size option, if present.
    pub fn get_mss_option(&self) -> Option<u16> {
        for option in self.options_iter() {
            if option.kind == OPTION_MSS && option.data.len() == 2 {
                return Some(get_u16(option.data, 0));
            }
        }
        None
    }

    pub fn has_sack_permitted_option(&self) -> bool {
        self.options_iter().any(|option| option.kind == OPTION_SACK_PERMITTED)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len()..]
    }

    /// Sequence space consumed by this segment: payload plus one for each
    /// of SYN and FIN.
    pub fn sequence_len(&self) -> u32 {
        let mut len = self.payload().len() as u32;
        if self.get_flags() & FLAG_SYN != 0 {
            len += 1;
        }
        if self.get_flags() & FLAG_FIN != 0 {
            len += 1;
        }
        len
    }

    /// Computes the segment checksum. `csum` must already hold the pseudo
    /// header written by the IP layer. The checksum field itself counts as
    /// zero.
    pub fn calculate_checksum(&self, mut csum: Checksum) -> u16 {
        csum.write(&self.data[..CHECKSUM_OFF]);
        csum.write_u16(0);
        csum.write(&self.data[CHECKSUM_OFF + 2..]);
        csum.finish()
    }

    pub fn validate_size(&self, v: &mut Validator) {
        let header_len = self.header_len();
        if header_len < Self::minimum_packet_size() {
            v.push(RxError::InvalidLengthField);
        } else if header_len > self.data.len() {
            v.push(RxError::ShortBuffer);
        }
    }
}

/// One parsed TCP option.
pub struct TcpOption<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

pub struct TcpOptionsIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for TcpOptionsIter<'a> {
    type Item = TcpOption<'a>;

    fn next(&mut self) -> Option<TcpOption<'a>> {
        while self.pos < self.data.len() {
            let kind = self.data[self.pos];
            match kind {
                OPTION_END => return None,
                OPTION_NOP => {
                    self.pos += 1;
                }
                _ => {
                    if self.pos + 1 >= self.data.len() {
                        return None;
                    }
                    let length = self.data[self.pos + 1] as usize;
                    if length < 2 || self.pos + length > self.data.len() {
                        return None;
                    }
                    let option = TcpOption {
                        kind: kind,
                        data: &self.data[self.pos + 2..self.pos + length],
                    };
                    self.pos += length;
                    return Some(option);
                }
            }
        }
        None
    }
}

pub struct MutableTcpPacket<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableTcpPacket<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableTcpPacket<'a>, RxError> {
        if data.len() < TcpPacket::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableTcpPacket { data: data })
    }

    pub fn to_immutable(&self) -> TcpPacket {
        TcpPacket { data: self.data }
    }

    pub fn set_source(&mut self, port: u16) {
        set_u16(self.data, SRC_PORT_OFF, port);
    }

    pub fn set_destination(&mut self, port: u16) {
        set_u16(self.data, DST_PORT_OFF, port);
    }

    pub fn set_sequence(&mut self, seq: u32) {
        set_u32(self.data, SEQ_OFF, seq);
    }

    pub fn set_acknowledgement(&mut self, ack: u32) {
        set_u32(self.data, ACK_OFF, ack);
    }

    pub fn set_data_offset(&mut self, words: u8) {
        self.data[DATA_OFF_OFF] = (words & 0x0f) << 4;
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.data[FLAGS_OFF] = flags;
    }

    pub fn set_window(&mut self, window: u16) {
        set_u16(self.data, WINDOW_OFF, window);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        set_u16(self.data, CHECKSUM_OFF, checksum);
    }

    pub fn set_urgent_pointer(&mut self, urgent: u16) {
        set_u16(self.data, URGENT_OFF, urgent);
    }

    /// Writes raw option bytes right after the fixed header. The caller is
    /// responsible for padding to a four byte boundary and setting the data
    /// offset accordingly.
    pub fn set_options_raw(&mut self, options: &[u8]) {
        self.data[OPTIONS_OFF..OPTIONS_OFF + options.len()].copy_from_slice(options);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.to_immutable().header_len();
        &mut self.data[header_len..]
    }
}
