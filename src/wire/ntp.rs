//! NTP packet view (RFC 5905, the fixed 48 byte header).

use errors::{RxError, Validator};
use wire::{get_u32, get_u64, set_u32, set_u64};

pub const PORT: u16 = 123;

pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

pub const VERSION: u8 = 4;

const LI_VN_MODE_OFF: usize = 0;
const STRATUM_OFF: usize = 1;
const POLL_OFF: usize = 2;
const PRECISION_OFF: usize = 3;
const ROOT_DELAY_OFF: usize = 4;
const ROOT_DISPERSION_OFF: usize = 8;
const REFERENCE_ID_OFF: usize = 12;
const REFERENCE_TS_OFF: usize = 16;
const ORIGIN_TS_OFF: usize = 24;
const RECEIVE_TS_OFF: usize = 32;
const TRANSMIT_TS_OFF: usize = 40;

pub struct NtpPacket<'a> {
    data: &'a [u8],
}

impl<'a> NtpPacket<'a> {
    pub fn new(data: &'a [u8]) -> Result<NtpPacket<'a>, RxError> {
        if data.len() < Self::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(NtpPacket { data: data })
    }

    pub fn minimum_packet_size() -> usize {
        48
    }

    pub fn get_leap_indicator(&self) -> u8 {
        self.data[LI_VN_MODE_OFF] >> 6
    }

    pub fn get_version(&self) -> u8 {
        (self.data[LI_VN_MODE_OFF] >> 3) & 0b111
    }

    pub fn get_mode(&self) -> u8 {
        self.data[LI_VN_MODE_OFF] & 0b111
    }

    pub fn get_stratum(&self) -> u8 {
        self.data[STRATUM_OFF]
    }

    pub fn get_poll(&self) -> i8 {
        self.data[POLL_OFF] as i8
    }

    pub fn get_precision(&self) -> i8 {
        self.data[PRECISION_OFF] as i8
    }

    pub fn get_root_delay(&self) -> u32 {
        get_u32(self.data, ROOT_DELAY_OFF)
    }

    pub fn get_root_dispersion(&self) -> u32 {
        get_u32(self.data, ROOT_DISPERSION_OFF)
    }

    pub fn get_reference_id(&self) -> u32 {
        get_u32(self.data, REFERENCE_ID_OFF)
    }

    /// 64 bit fixed point NTP timestamps: seconds since 1900 in the high
    /// half, fraction in the low half.
    pub fn get_reference_timestamp(&self) -> u64 {
        get_u64(self.data, REFERENCE_TS_OFF)
    }

    pub fn get_origin_timestamp(&self) -> u64 {
        get_u64(self.data, ORIGIN_TS_OFF)
    }

    pub fn get_receive_timestamp(&self) -> u64 {
        get_u64(self.data, RECEIVE_TS_OFF)
    }

    pub fn get_transmit_timestamp(&self) -> u64 {
        get_u64(self.data, TRANSMIT_TS_OFF)
    }

    pub fn validate_size(&self, v: &mut Validator) {
        if self.data.len() < Self::minimum_packet_size() {
            v.push(RxError::ShortBuffer);
        }
    }
}

pub struct MutableNtpPacket<'a> {
    data: &'a mut [u8],
}

impl<'a> MutableNtpPacket<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<MutableNtpPacket<'a>, RxError> {
        if data.len() < NtpPacket::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        Ok(MutableNtpPacket { data: data })
    }

    pub fn to_immutable(&self) -> NtpPacket {
        NtpPacket { data: self.data }
    }

    pub fn set_leap_vn_mode(&mut self, leap: u8, version: u8, mode: u8) {
        self.data[LI_VN_MODE_OFF] = (leap << 6) | ((version & 0b111) << 3) | (mode & 0b111);
    }

    pub fn set_stratum(&mut self, stratum: u8) {
        self.data[STRATUM_OFF] = stratum;
    }

    pub fn set_poll(&mut self, poll: i8) {
        self.data[POLL_OFF] = poll as u8;
    }

    pub fn set_precision(&mut self, precision: i8) {
        self.data[PRECISION_OFF] = precision as u8;
    }

    pub fn set_root_delay(&mut self, value: u32) {
        set_u32(self.data, ROOT_DELAY_OFF, value);
    }

    pub fn set_root_dispersion(&mut self, value: u32) {
        set_u32(self.data, ROOT_DISPERSION_OFF, value);
    }

    pub fn set_reference_id(&mut self, value: u32) {
        set_u32(self.data, REFERENCE_ID_OFF, value);
    }

    pub fn set_reference_timestamp(&mut self, ts: u64) {
        set_u64(self.data, REFERENCE_TS_OFF, ts);
    }

    pub fn set_origin_timestamp(&mut self, ts: u64) {
        set_u64(self.data, ORIGIN_TS_OFF, ts);
    }

    pub fn set_receive_timestamp(&mut self, ts: u64) {
        set_u64(self.data, RECEIVE_TS_OFF, ts);
    }

    pub fn set_transmit_timestamp(&mut self, ts: u64) {
        set_u64(self.data, TRANSMIT_TS_OFF, ts);
    }
}
