//! DHCPv4 message view (RFC 2131) with TLV option support.

use errors::{RxError, Validator};
use std::net::Ipv4Addr;
use wire::{get_u16, get_u32, set_u16, set_u32};

pub const OP_BOOTREQUEST: u8 = 1;
pub const OP_BOOTREPLY: u8 = 2;

pub const MAGIC_COOKIE: u32 = 0x6382_5363;

pub const CLIENT_PORT: u16 = 68;
pub const SERVER_PORT: u16 = 67;

/// The broadcast bit in the flags field.
pub const FLAG_BROADCAST: u16 = 0x8000;

pub const OPTION_PAD: u8 = 0;
pub const OPTION_SUBNET_MASK: u8 = 1;
pub const OPTION_ROUTER: u8 = 3;
pub const OPTION_DNS_SERVERS: u8 = 6;
pub const OPTION_HOST_NAME: u8 = 12;
pub const OPTION_BROADCAST_ADDR: u8 = 28;
pub const OPTION_NTP_SERVERS: u8 = 42;
pub const OPTION_REQUESTED_IP: u8 = 50;
pub const OPTION_LEASE_TIME: u8 = 51;
pub const OPTION_MESSAGE_TYPE: u8 = 53;
pub const OPTION_SERVER_ID: u8 = 54;
pub const OPTION_PARAMETER_REQUEST_LIST: u8 = 55;
pub const OPTION_MAX_MESSAGE_SIZE: u8 = 57;
pub const OPTION_RENEWAL_TIME: u8 = 58;
pub const OPTION_REBINDING_TIME: u8 = 59;
pub const OPTION_CLIENT_ID: u8 = 61;
pub const OPTION_END: u8 = 255;

/// DHCP message type option values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        use self::MessageType::*;
        match value {
            1 => Some(Discover),
            2 => Some(Offer),
            3 => Some(Request),
            4 => Some(Decline),
            5 => Some(Ack),
            6 => Some(Nak),
            7 => Some(Release),
            8 => Some(Inform),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        use self::MessageType::*;
        match *self {
            Discover => 1,
            Offer => 2,
            Request => 3,
            Decline => 4,
            Ack => 5,
            Nak => 6,
            Release => 7,
            Inform => 8,
        }
    }
}

const OP_OFF: usize = 0;
const HTYPE_OFF: usize = 1;
const HLEN_OFF: usize = 2;
const HOPS_OFF: usize = 3;
const XID_OFF: usize = 4;
const SECS_OFF: usize = 8;
const FLAGS_OFF: usize = 10;
const CIADDR_OFF: usize = 12;
const YIADDR_OFF: usize = 16;
const SIADDR_OFF: usize = 20;
const GIADDR_OFF: usize = 24;
const CHADDR_OFF: usize = 28;
const SNAME_OFF: usize = 44;
const FILE_OFF: usize = 108;
const COOKIE_OFF: usize = 236;

/// First byte of the options area: 44 + 64 + 128 + 4 past the chaddr field.
pub const OPTIONS_OFF: usize = 240;

fn get_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

fn set_addr(data: &mut [u8], offset: usize, addr: Ipv4Addr) {
    data[offset..offset + 4].copy_from_slice(&addr.octets());
}

pub struct DhcpPacket<'a> {
    data: &'a [u8],
}

impl<'a> DhcpPacket<'a> {
    pub fn new(data: &'a [u8]) -> Result<DhcpPacket<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(DhcpPacket { data: data })
    }

    /// Fixed header, bootp legacy fields and the magic cookie.
    pub fn minimum_packet_size() -> usize {
        OPTIONS_OFF
    }

    pub fn get_op(&self) -> u8 {
        self.data[OP_OFF]
    }

    pub fn get_hardware_type(&self) -> u8 {
        self.data[HTYPE_OFF]
    }

    pub fn get_hardware_len(&self) -> u8 {
        self.data[HLEN_OFF]
    }

    pub fn get_hops(&self) -> u8 {
        self.data[HOPS_OFF]
    }

    pub fn get_xid(&self) -> u32 {
        get_u32(self.data, XID_OFF)
    }

    pub fn get_secs(&self) -> u16 {
        get_u16(self.data, SECS_OFF)
    }

    pub fn get_flags(&self) -> u16 {
        get_u16(self.data, FLAGS_OFF)
    }

    pub fn get_ciaddr(&self) -> Ipv4Addr {
        get_addr(self.data, CIADDR_OFF)
    }

    pub fn get_yiaddr(&self) -> Ipv4Addr {
        get_addr(self.data, YIADDR_OFF)
    }

    pub fn get_siaddr(&self) -> Ipv4Addr {
        get_addr(self.data, SIADDR_OFF)
    }

    pub fn get_giaddr(&self) -> Ipv4Addr {
        get_addr(self.data, GIADDR_OFF)
    }

    /// The full 16 byte client hardware address field.
    pub fn get_chaddr(&self) -> &[u8] {
        &self.data[CHADDR_OFF..CHADDR_OFF + 16]
    }

    pub fn get_sname(&self) -> &[u8] {
        &self.data[SNAME_OFF..SNAME_OFF + 64]
    }

    pub fn get_file(&self) -> &[u8] {
        &self.data[FILE_OFF..FILE_OFF + 128]
    }

    pub fn get_magic_cookie(&self) -> u32 {
        get_u32(self.data, COOKIE_OFF)
    }

    pub fn options_iter(&self) -> DhcpOptionsIter {
        DhcpOptionsIter {
            data: &self.data[OPTIONS_OFF..],
            pos: 0,
        }
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        for option in self.options_iter() {
            if option.code == OPTION_MESSAGE_TYPE && option.data.len() == 1 {
                return MessageType::from_u8(option.data[0]);
            }
        }
        None
    }

    /// Finds the first option with the given code.
    pub fn find_option(&self, code: u8) -> Option<&[u8]> {
        for option in self.options_iter() {
            if option.code == code {
                return Some(option.data);
            }
        }
        None
    }

    pub fn validate_size(&self, v: &mut Validator) {
        if self.get_magic_cookie() != MAGIC_COOKIE {
            v.push(RxError::Unsupported);
        }
        if self.get_hardware_len() as usize > 16 {
            v.push(RxError::InvalidLengthField);
        }
    }
}

/// One parsed DHCP option.
pub struct DhcpOption<'a> {
    pub code: u8,
    pub data: &'a [u8],
}

impl<'a> DhcpOption<'a> {
    pub fn as_addr(&self) -> Option<Ipv4Addr> {
        if self.data.len() == 4 {
            Some(get_addr(self.data, 0))
        } else {
            None
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() == 4 {
            Some(get_u32(self.data, 0))
        } else {
            None
        }
    }

    /// Iterates the option payload as a list of IPv4 addresses.
    pub fn addr_list(&self) -> Vec<Ipv4Addr> {
        self.data.chunks(4).filter(|c| c.len() == 4).map(|c| get_addr(c, 0)).collect()
    }
}

pub struct DhcpOptionsIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for DhcpOptionsIter<'a> {
    type Item = DhcpOption<'a>;

    fn next(&mut self) -> Option<DhcpOption<'a>> {
        while self.pos < self.data.len() {
            let code = self.data[self.pos];
            match code {
                OPTION_END => return None,
                OPTION_PAD => {
                    self.pos += 1;
                }
                _ => {
                    if self.pos + 1 >= self.data.len() {
                        return None;
                    }
                    let length = self.data[self.pos + 1] as usize;
                    if self.pos + 2 + length > self.data.len() {
                        return None;
                    }
                    let option = DhcpOption {
                        code: code,
                        data: &self.data[self.pos + 2..self.pos + 2 + length],
                    };
                    self.pos += 2 + length;
                    return Some(option);
                }
            }
        }
        None
    }
}

pub struct MutableDhcpPacket<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableDhcpPacket<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableDhcpPacket<'a>, RxError> {
        if data.len() < DhcpPacket::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableDhcpPacket { data: data })
    }

    pub fn to_immutable(&self) -> DhcpPacket {
        DhcpPacket { data: self.data }
    }

    /// Zeroes the whole fixed area and writes the magic cookie, leaving the
    /// packet ready for field setters and an options writer.
    pub fn prepare(&mut self) {
        for byte in self.data[..OPTIONS_OFF].iter_mut() {
            *byte = 0;
        }
        set_u32(self.data, COOKIE_OFF, MAGIC_COOKIE);
    }

    pub fn set_op(&mut self, op: u8) {
        self.data[OP_OFF] = op;
    }

    pub fn set_hardware_type(&mut self, htype: u8) {
        self.data[HTYPE_OFF] = htype;
    }

    pub fn set_hardware_len(&mut self, hlen: u8) {
        self.data[HLEN_OFF] = hlen;
    }

    pub fn set_hops(&mut self, hops: u8) {
        self.data[HOPS_OFF] = hops;
    }

    pub fn set_xid(&mut self, xid: u32) {
        set_u32(self.data, XID_OFF, xid);
    }

    pub fn set_secs(&mut self, secs: u16) {
        set_u16(self.data, SECS_OFF, secs);
    }

    pub fn set_flags(&mut self, flags: u16) {
        set_u16(self.data, FLAGS_OFF, flags);
    }

    pub fn set_ciaddr(&mut self, addr: Ipv4Addr) {
        set_addr(self.data, CIADDR_OFF, addr);
    }

    pub fn set_yiaddr(&mut self, addr: Ipv4Addr) {
        set_addr(self.data, YIADDR_OFF, addr);
    }

    pub fn set_siaddr(&mut self, addr: Ipv4Addr) {
        set_addr(self.data, SIADDR_OFF, addr);
    }

    pub fn set_giaddr(&mut self, addr: Ipv4Addr) {
        set_addr(self.data, GIADDR_OFF, addr);
    }

    /// Writes the client hardware address, zero padding the 16 byte field.
    pub fn set_chaddr(&mut self, addr: &[u8]) {
        assert!(addr.len() <= 16);
        for byte in self.data[CHADDR_OFF..CHADDR_OFF + 16].iter_mut() {
            *byte = 0;
        }
        self.data[CHADDR_OFF..CHADDR_OFF + addr.len()].copy_from_slice(addr);
    }

    pub fn set_magic_cookie(&mut self) {
        set_u32(self.data, COOKIE_OFF, MAGIC_COOKIE);
    }

    /// Returns a cursor that appends options after the magic cookie. Call
    /// `finish` on the writer to terminate the list and learn the total
    /// packet length.
    pub fn options_writer(&mut self) -> DhcpOptionsWriter {
        DhcpOptionsWriter {
            data: &mut *self.data,
            pos: OPTIONS_OFF,
        }
    }
}

/// Append-only cursor over the options area of a `MutableDhcpPacket`.
pub struct DhcpOptionsWriter<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> DhcpOptionsWriter<'a> {
    /// Appends one option, leaving room for the terminating end option.
    pub fn write(&mut self, code: u8, data: &[u8]) -> Result<(), RxError> {
        assert!(data.len() <= 255);
        if self.pos + 2 + data.len() + 1 > self.data.len() {
            return Err(RxError::ShortBuffer);
        }
        self.data[self.pos] = code;
        self.data[self.pos + 1] = data.len() as u8;
        self.data[self.pos + 2..self.pos + 2 + data.len()].copy_from_slice(data);
        self.pos += 2 + data.len();
        Ok(())
    }

    pub fn write_message_type(&mut self, kind: MessageType) -> Result<(), RxError> {
        self.write(OPTION_MESSAGE_TYPE, &[kind.to_u8()])
    }

    pub fn write_addr(&mut self, code: u8, addr: Ipv4Addr) -> Result<(), RxError> {
        self.write(code, &addr.octets())
    }

    pub fn write_u32(&mut self, code: u8, value: u32) -> Result<(), RxError> {
        let mut buf = [0u8; 4];
        set_u32(&mut buf, 0, value);
        self.write(code, &buf)
    }

    /// Terminates the option list and returns the total message length.
    pub fn finish(self) -> usize {
        self.data[self.pos] = OPTION_END;
        self.pos + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::Validator;
    use std::net::Ipv4Addr;

    #[test]
    fn build_and_parse_discover() {
        let mut buf = [0u8; 300];
        let total = {
            let mut pkg = MutableDhcpPacket::new(&mut buf).unwrap();
            pkg.prepare();
            pkg.set_op(OP_BOOTREQUEST);
            pkg.set_hardware_type(1);
            pkg.set_hardware_len(6);
            pkg.set_xid(123);
            pkg.set_flags(FLAG_BROADCAST);
            pkg.set_chaddr(&[0, 0, 0, 0, 0, 1]);
            let mut options = pkg.options_writer();
            options.write_message_type(MessageType::Discover).unwrap();
            options.write_addr(OPTION_REQUESTED_IP, Ipv4Addr::new(192, 168, 1, 2)).unwrap();
            options.finish()
        };
        let pkg = DhcpPacket::new(&buf[..total]).unwrap();
        assert_eq!(OP_BOOTREQUEST, pkg.get_op());
        assert_eq!(123, pkg.get_xid());
        assert_eq!(FLAG_BROADCAST, pkg.get_flags());
        assert_eq!(MAGIC_COOKIE, pkg.get_magic_cookie());
        assert_eq!(Some(MessageType::Discover), pkg.get_message_type());
        assert_eq!(&[0, 0, 0, 0, 0, 1], &pkg.get_chaddr()[..6]);
        assert_eq!(Some(Ipv4Addr::new(192, 168, 1, 2)),
                   pkg.find_option(OPTION_REQUESTED_IP)
                       .and_then(|data| DhcpOption { code: OPTION_REQUESTED_IP, data: data }
                           .as_addr()));
        let mut v = Validator::new();
        pkg.validate_size(&mut v);
        assert_eq!(Ok(()), v.result());
    }

    #[test]
    fn missing_cookie_rejected() {
        let buf = [0u8; 240];
        let pkg = DhcpPacket::new(&buf).unwrap();
        let mut v = Validator::new();
        pkg.validate_size(&mut v);
        assert!(v.has_error());
    }

    #[test]
    fn addr_list_option() {
        let option = DhcpOption {
            code: OPTION_DNS_SERVERS,
            data: &[8, 8, 8, 8, 1, 1, 1, 1],
        };
        assert_eq!(vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
                   option.addr_list());
    }

    #[test]
    fn options_writer_refuses_overflow() {
        let mut buf = [0u8; 244];
        let mut pkg = MutableDhcpPacket::new(&mut buf).unwrap();
        pkg.prepare();
        let mut options = pkg.options_writer();
        options.write_message_type(MessageType::Discover).unwrap();
        assert!(options.write(OPTION_HOST_NAME, b"too-long-to-fit").is_err());
    }
}
