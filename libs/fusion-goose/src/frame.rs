//! GOOSE PDU and frame encoding
//!
//! Frame payload layout after the 802.1Q tag and ethertype `0x88B8`:
//!
//! ```text
//! [appid:u16][length:u16][reserve1:u16][reserve2:u16][pdu ...][extension ...]
//! ```
//!
//! `length` counts the 8 header bytes plus the PDU. Plain frames carry zero in both
//! reserve words. Secure frames put the extension length in the low byte of
//! `reserve1` (`0x23`: a 3-byte TLV header plus a 32-byte HMAC-SHA256), a CRC-16/MODBUS
//! of ethertype, appid, length and reserve1 in `reserve2`, and append
//! `0xAD 0x00 0x20` followed by the HMAC computed over ethertype, header and PDU.

use crate::ber::{self, BerEntry, BerReader};
use crate::error::{GooseError, GooseResult};
use crate::ethernet::{EthernetFrame, MacAddress, VlanTag};
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const GOOSE_ETHERTYPE: u16 = 0x88B8;

const HEADER_LEN: usize = 8;
const MAX_VISIBLE_STRING: usize = 65;

const SECURE_EXTENSION_LEN: u8 = 0x23;
const HMAC_LEN: usize = 32;
const HMAC_TLV_HEADER: [u8; 3] = [0xAD, 0x00, 0x20];

const HEADER_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Timestamp
// ============================================================================

/// UTC time as carried in the PDU: seconds, 24-bit binary fraction, time quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GooseTimestamp {
    pub seconds: u32,
    pub fraction: u32,
    pub quality: u8,
}

impl GooseTimestamp {
    /// Quality byte for millisecond resolution (about 10 significant fraction bits)
    pub const MILLISECOND_QUALITY: u8 = 10;

    pub fn from_millis(ms: u64) -> Self {
        let fraction = (ms % 1000) * 0x0100_0000 / 1000;
        Self {
            seconds: (ms / 1000) as u32,
            fraction: fraction as u32,
            quality: Self::MILLISECOND_QUALITY,
        }
    }

    pub fn now() -> Self {
        Self::from_millis(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn as_millis(&self) -> u64 {
        u64::from(self.seconds) * 1000 + u64::from(self.fraction) * 1000 / 0x0100_0000
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let s = self.seconds.to_be_bytes();
        let f = self.fraction.to_be_bytes();
        [s[0], s[1], s[2], s[3], f[1], f[2], f[3], self.quality]
    }

    pub fn from_bytes(raw: &[u8]) -> GooseResult<Self> {
        let raw: [u8; 8] = raw.try_into().map_err(|_| {
            GooseError::decoding(format!("Timestamp must be 8 bytes, got {}", raw.len()))
        })?;
        Ok(Self {
            seconds: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            fraction: u32::from_be_bytes([0, raw[4], raw[5], raw[6]]),
            quality: raw[7],
        })
    }
}

// ============================================================================
// PDU
// ============================================================================

mod tag {
    pub const ROOT: u8 = 0x61;
    pub const GOCB_REF: u8 = 0x80;
    pub const TIME_ALLOWED_TO_LIVE: u8 = 0x81;
    pub const DAT_SET: u8 = 0x82;
    pub const GO_ID: u8 = 0x83;
    pub const TIMESTAMP: u8 = 0x84;
    pub const ST_NUM: u8 = 0x85;
    pub const SQ_NUM: u8 = 0x86;
    pub const SIMULATION: u8 = 0x87;
    pub const CONF_REV: u8 = 0x88;
    pub const NDS_COM: u8 = 0x89;
    pub const NUM_DAT_SET_ENTRIES: u8 = 0x8A;
    pub const ALL_DATA: u8 = 0xAB;
}

/// Decoded GOOSE APDU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoosePdu {
    pub go_cb_ref: String,
    /// Milliseconds until the subscriber may consider the publisher lost
    pub time_allowed_to_live: u32,
    pub dat_set: String,
    pub go_id: String,
    pub timestamp: GooseTimestamp,
    pub st_num: u32,
    pub sq_num: u32,
    pub simulation: bool,
    pub conf_rev: u32,
    pub nds_com: bool,
    /// `allData` entries; their count is written as `numDatSetEntries`
    pub entries: Vec<BerEntry>,
}

impl GoosePdu {
    pub fn to_bytes(&self) -> GooseResult<Vec<u8>> {
        let mut body = BytesMut::with_capacity(128);
        ber::write_tlv(&mut body, tag::GOCB_REF, &visible_string(&self.go_cb_ref, "gocbRef")?)?;
        ber::write_tlv(
            &mut body,
            tag::TIME_ALLOWED_TO_LIVE,
            &ber::encode_u32(self.time_allowed_to_live),
        )?;
        ber::write_tlv(&mut body, tag::DAT_SET, &visible_string(&self.dat_set, "datSet")?)?;
        ber::write_tlv(&mut body, tag::GO_ID, &visible_string(&self.go_id, "goID")?)?;
        ber::write_tlv(&mut body, tag::TIMESTAMP, &self.timestamp.to_bytes())?;
        ber::write_tlv(&mut body, tag::ST_NUM, &ber::encode_u32(self.st_num))?;
        ber::write_tlv(&mut body, tag::SQ_NUM, &ber::encode_u32(self.sq_num))?;
        ber::write_tlv(&mut body, tag::SIMULATION, &[u8::from(self.simulation)])?;
        ber::write_tlv(&mut body, tag::CONF_REV, &ber::encode_u32(self.conf_rev))?;
        ber::write_tlv(&mut body, tag::NDS_COM, &[u8::from(self.nds_com)])?;
        ber::write_tlv(
            &mut body,
            tag::NUM_DAT_SET_ENTRIES,
            &ber::encode_u32(self.entries.len() as u32),
        )?;

        let mut all_data = BytesMut::new();
        for entry in &self.entries {
            entry.encode_into(&mut all_data)?;
        }
        ber::write_tlv(&mut body, tag::ALL_DATA, &all_data)?;

        let mut root = BytesMut::with_capacity(body.len() + 4);
        ber::write_tlv(&mut root, tag::ROOT, &body)?;
        Ok(root.to_vec())
    }

    pub fn from_bytes(data: &[u8]) -> GooseResult<Self> {
        let mut outer = BerReader::new(data);
        let root = outer.expect(tag::ROOT, "goosePdu")?;
        if !outer.is_empty() {
            return Err(GooseError::decoding(format!(
                "{} trailing bytes after goosePdu",
                outer.remaining()
            )));
        }

        let mut r = BerReader::new(root);
        let go_cb_ref = parse_visible_string(r.expect(tag::GOCB_REF, "gocbRef")?, "gocbRef")?;
        let time_allowed_to_live =
            ber::decode_u32(r.expect(tag::TIME_ALLOWED_TO_LIVE, "timeAllowedToLive")?)?;
        let dat_set = parse_visible_string(r.expect(tag::DAT_SET, "datSet")?, "datSet")?;
        let go_id = parse_visible_string(r.expect(tag::GO_ID, "goID")?, "goID")?;
        let timestamp = GooseTimestamp::from_bytes(r.expect(tag::TIMESTAMP, "t")?)?;
        let st_num = ber::decode_u32(r.expect(tag::ST_NUM, "stNum")?)?;
        let sq_num = ber::decode_u32(r.expect(tag::SQ_NUM, "sqNum")?)?;
        let simulation = ber::decode_u8(r.expect(tag::SIMULATION, "simulation")?)? != 0;
        let conf_rev = ber::decode_u32(r.expect(tag::CONF_REV, "confRev")?)?;
        let nds_com = ber::decode_u8(r.expect(tag::NDS_COM, "ndsCom")?)? != 0;
        let count = ber::decode_u32(r.expect(tag::NUM_DAT_SET_ENTRIES, "numDatSetEntries")?)?;
        let all_data = r.expect(tag::ALL_DATA, "allData")?;
        if !r.is_empty() {
            return Err(GooseError::decoding(format!(
                "{} unexpected bytes after allData",
                r.remaining()
            )));
        }

        let mut data_reader = BerReader::new(all_data);
        let mut entries = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let (entry_tag, value) = data_reader.next_entry()?;
            entries.push(BerEntry::new(entry_tag, value));
        }
        if !data_reader.is_empty() {
            return Err(GooseError::decoding(format!(
                "allData holds more than the declared {count} entries"
            )));
        }

        Ok(Self {
            go_cb_ref,
            time_allowed_to_live,
            dat_set,
            go_id,
            timestamp,
            st_num,
            sq_num,
            simulation,
            conf_rev,
            nds_com,
            entries,
        })
    }
}

/// NUL-terminated visible string, at most 65 bytes including the terminator
fn visible_string(value: &str, field: &str) -> GooseResult<Vec<u8>> {
    if value.len() + 1 > MAX_VISIBLE_STRING {
        return Err(GooseError::encoding(format!(
            "{field} is {} bytes, limit is {}",
            value.len(),
            MAX_VISIBLE_STRING - 1
        )));
    }
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

fn parse_visible_string(value: &[u8], field: &str) -> GooseResult<String> {
    if value.len() > MAX_VISIBLE_STRING {
        return Err(GooseError::decoding(format!(
            "{field} is {} bytes, limit is {MAX_VISIBLE_STRING}",
            value.len()
        )));
    }
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8(value[..end].to_vec())
        .map_err(|e| GooseError::decoding(format!("{field} is not valid UTF-8: {e}")))
}

// ============================================================================
// Frame
// ============================================================================

/// A GOOSE publication addressed on the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GooseFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub vlan: VlanTag,
    pub appid: u16,
    pub pdu: GoosePdu,
}

impl GooseFrame {
    /// Plain frame, both reserve words zero
    pub fn to_ethernet(&self) -> GooseResult<EthernetFrame> {
        let pdu = self.pdu.to_bytes()?;
        let mut payload = BytesMut::with_capacity(HEADER_LEN + pdu.len());
        payload.put_u16(self.appid);
        payload.put_u16(header_length(&pdu)?);
        payload.put_u16(0);
        payload.put_u16(0);
        payload.put_slice(&pdu);
        Ok(self.ethernet(payload.to_vec()))
    }

    /// Secure frame signed with `key`
    pub fn to_secure_ethernet(&self, key: &[u8]) -> GooseResult<EthernetFrame> {
        let pdu = self.pdu.to_bytes()?;

        // Ethertype leads the CRC and HMAC input but is not part of the payload
        let mut signed = BytesMut::with_capacity(2 + HEADER_LEN + pdu.len());
        signed.put_u16(GOOSE_ETHERTYPE);
        signed.put_u16(self.appid);
        signed.put_u16(header_length(&pdu)?);
        signed.put_u16(u16::from(SECURE_EXTENSION_LEN));
        let crc = HEADER_CRC.checksum(&signed);
        signed.put_u16(crc);
        signed.put_slice(&pdu);

        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| GooseError::Authentication(format!("HMAC key rejected: {e}")))?;
        mac.update(&signed);
        let digest = mac.finalize().into_bytes();

        let mut payload = BytesMut::with_capacity(signed.len() + HMAC_TLV_HEADER.len() + HMAC_LEN);
        payload.put_slice(&signed[2..]);
        payload.put_slice(&HMAC_TLV_HEADER);
        payload.put_slice(&digest);
        Ok(self.ethernet(payload.to_vec()))
    }

    /// Serialize to wire bytes, signed when a key is given
    pub fn to_bytes(&self, key: Option<&[u8]>) -> GooseResult<Vec<u8>> {
        let frame = match key {
            Some(key) => self.to_secure_ethernet(key)?,
            None => self.to_ethernet()?,
        };
        Ok(frame.to_bytes())
    }

    /// Parse a plain frame; secure frames are rejected
    pub fn from_ethernet(frame: &EthernetFrame) -> GooseResult<Self> {
        let header = Header::parse(frame)?;
        if header.reserve1 != 0 || header.reserve2 != 0 {
            return Err(GooseError::decoding(format!(
                "Plain frame with reserve words 0x{:04X}/0x{:04X}",
                header.reserve1, header.reserve2
            )));
        }
        if frame.payload.len() != header.length {
            return Err(GooseError::decoding(format!(
                "Payload is {} bytes, header declares {}",
                frame.payload.len(),
                header.length
            )));
        }
        header.into_frame(frame)
    }

    /// Parse a secure frame. The header CRC is always checked; the HMAC only when
    /// a key is supplied.
    pub fn from_secure_ethernet(frame: &EthernetFrame, key: Option<&[u8]>) -> GooseResult<Self> {
        let header = Header::parse(frame)?;
        let extension_len = usize::from(header.reserve1 & 0x00FF);
        if extension_len == 0 {
            return Err(GooseError::decoding("reserve1 carries no extension, not a secure frame"));
        }
        if extension_len < HMAC_LEN {
            return Err(GooseError::decoding(format!(
                "Extension of {extension_len} bytes cannot hold an HMAC-SHA256"
            )));
        }
        let total = header.length + extension_len;
        if frame.payload.len() < total {
            return Err(GooseError::decoding(format!(
                "Payload is {} bytes, header and extension need {total}",
                frame.payload.len()
            )));
        }

        let mut crc_input = [0u8; 8];
        crc_input[..2].copy_from_slice(&frame.ethertype.to_be_bytes());
        crc_input[2..].copy_from_slice(&frame.payload[..6]);
        let crc = HEADER_CRC.checksum(&crc_input);
        if crc != header.reserve2 {
            return Err(GooseError::decoding(format!(
                "Header CRC mismatch: computed 0x{crc:04X}, frame carries 0x{:04X}",
                header.reserve2
            )));
        }

        if let Some(key) = key {
            let signature = &frame.payload[total - HMAC_LEN..total];
            let signed_len = total.saturating_sub(HMAC_LEN + HMAC_TLV_HEADER.len());
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| GooseError::Authentication(format!("HMAC key rejected: {e}")))?;
            mac.update(&frame.ethertype.to_be_bytes());
            mac.update(&frame.payload[..signed_len]);
            mac.verify_slice(signature)
                .map_err(|_| GooseError::Authentication("HMAC does not match".to_string()))?;
        }

        header.into_frame(frame)
    }

    fn ethernet(&self, payload: Vec<u8>) -> EthernetFrame {
        EthernetFrame {
            destination: self.destination,
            source: self.source,
            vlan: Some(self.vlan),
            ethertype: GOOSE_ETHERTYPE,
            payload,
        }
    }
}

fn header_length(pdu: &[u8]) -> GooseResult<u16> {
    u16::try_from(pdu.len() + HEADER_LEN).map_err(|_| {
        GooseError::encoding(format!("PDU of {} bytes does not fit a frame", pdu.len()))
    })
}

struct Header {
    vlan: VlanTag,
    appid: u16,
    length: usize,
    reserve1: u16,
    reserve2: u16,
}

impl Header {
    fn parse(frame: &EthernetFrame) -> GooseResult<Self> {
        if frame.ethertype != GOOSE_ETHERTYPE {
            return Err(GooseError::decoding(format!(
                "Ethertype 0x{:04X} is not GOOSE",
                frame.ethertype
            )));
        }
        let vlan = frame
            .vlan
            .ok_or_else(|| GooseError::decoding("GOOSE frame without 802.1Q tag"))?;
        let p = &frame.payload;
        if p.len() < HEADER_LEN {
            return Err(GooseError::decoding(format!(
                "GOOSE header needs {HEADER_LEN} bytes, got {}",
                p.len()
            )));
        }
        let length = usize::from(u16::from_be_bytes([p[2], p[3]]));
        if length < HEADER_LEN || length > p.len() {
            return Err(GooseError::decoding(format!(
                "Header length {length} out of range for {} byte payload",
                p.len()
            )));
        }
        Ok(Self {
            vlan,
            appid: u16::from_be_bytes([p[0], p[1]]),
            length,
            reserve1: u16::from_be_bytes([p[4], p[5]]),
            reserve2: u16::from_be_bytes([p[6], p[7]]),
        })
    }

    fn into_frame(self, frame: &EthernetFrame) -> GooseResult<GooseFrame> {
        Ok(GooseFrame {
            destination: frame.destination,
            source: frame.source,
            vlan: self.vlan,
            appid: self.appid,
            pdu: GoosePdu::from_bytes(&frame.payload[HEADER_LEN..self.length])?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;

    fn sample_pdu() -> GoosePdu {
        GoosePdu {
            go_cb_ref: "CC/0$GO$PowerRequest".to_string(),
            time_allowed_to_live: 2000,
            dat_set: "CC/0$PowerRequest".to_string(),
            go_id: "CC/0$GO$PowerRequest".to_string(),
            timestamp: GooseTimestamp::from_millis(1_700_000_000_500),
            st_num: 3,
            sq_num: 7,
            simulation: false,
            conf_rev: 1,
            nds_com: false,
            entries: vec![BerEntry::new(0x86, vec![0, 0, 0, 1])],
        }
    }

    fn sample_frame() -> GooseFrame {
        GooseFrame {
            destination: MacAddress([0x01, 0x0C, 0xCD, 0x01, 0x00, 0x01]),
            source: MacAddress([0x02, 0, 0, 0, 0, 0x01]),
            vlan: VlanTag::new(5, 0),
            appid: 0x0001,
            pdu: sample_pdu(),
        }
    }

    #[test]
    fn test_timestamp_from_millis() {
        let ts = GooseTimestamp::from_millis(1_500);
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.fraction, 0x80_0000);
        assert_eq!(ts.quality, 10);
        assert_eq!(ts.as_millis(), 1_500);
        assert_eq!(ts.to_bytes(), [0, 0, 0, 1, 0x80, 0, 0, 10]);
        assert!(GooseTimestamp::from_bytes(&[0; 7]).is_err());
    }

    #[test]
    fn test_pdu_strings_are_nul_terminated() {
        let bytes = sample_pdu().to_bytes().unwrap();
        assert_eq!(bytes[0], 0x61);
        let go_cb_ref = b"CC/0$GO$PowerRequest\0";
        let start = bytes.iter().position(|&b| b == 0x80).unwrap();
        assert_eq!(bytes[start + 1] as usize, go_cb_ref.len());
        assert_eq!(&bytes[start + 2..start + 2 + go_cb_ref.len()], go_cb_ref);
        assert_eq!(GoosePdu::from_bytes(&bytes).unwrap(), sample_pdu());
    }

    #[test]
    fn test_pdu_rejects_long_strings() {
        let mut pdu = sample_pdu();
        pdu.go_id = "x".repeat(65);
        assert!(matches!(pdu.to_bytes(), Err(GooseError::Encoding(_))));
    }

    #[test]
    fn test_pdu_rejects_extra_entries() {
        let mut bytes = sample_pdu().to_bytes().unwrap();
        // Declare zero entries while allData still holds one
        let count_at = bytes.iter().position(|&b| b == 0x8A).unwrap();
        bytes[count_at + 5] = 0;
        let err = GoosePdu::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("allData"));
    }

    #[test]
    fn test_pdu_rejects_trailing_bytes() {
        let mut bytes = sample_pdu().to_bytes().unwrap();
        bytes.push(0);
        assert!(GoosePdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_plain_frame_header() {
        let frame = sample_frame();
        let eth = frame.to_ethernet().unwrap();
        let pdu_len = frame.pdu.to_bytes().unwrap().len();
        assert_eq!(&eth.payload[..2], &[0x00, 0x01]);
        assert_eq!(
            u16::from_be_bytes([eth.payload[2], eth.payload[3]]) as usize,
            pdu_len + 8
        );
        assert_eq!(&eth.payload[4..8], &[0, 0, 0, 0]);
        assert_eq!(GooseFrame::from_ethernet(&eth).unwrap(), frame);
    }

    #[test]
    fn test_plain_parser_rejects_secure_frame() {
        let eth = sample_frame().to_secure_ethernet(&[0x11; 48]).unwrap();
        assert!(GooseFrame::from_ethernet(&eth).is_err());
    }

    #[test]
    fn test_secure_frame_layout() {
        let key = [0x42u8; 48];
        let frame = sample_frame();
        let eth = frame.to_secure_ethernet(&key).unwrap();
        let length = u16::from_be_bytes([eth.payload[2], eth.payload[3]]) as usize;

        assert_eq!(&eth.payload[4..6], &[0x00, 0x23]);
        assert_eq!(eth.payload.len(), length + 35);
        assert_eq!(&eth.payload[length..length + 3], &[0xAD, 0x00, 0x20]);

        let mut crc_input = vec![0x88, 0xB8];
        crc_input.extend_from_slice(&eth.payload[..6]);
        let crc = HEADER_CRC.checksum(&crc_input);
        assert_eq!(&eth.payload[6..8], &crc.to_be_bytes());

        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(&[0x88, 0xB8]);
        mac.update(&eth.payload[..length]);
        assert_eq!(&eth.payload[length + 3..], mac.finalize().into_bytes().as_slice());
    }

    #[test]
    fn test_secure_frame_verification() {
        let key = [0x42u8; 48];
        let frame = sample_frame();
        let eth = frame.to_secure_ethernet(&key).unwrap();

        assert_eq!(GooseFrame::from_secure_ethernet(&eth, Some(&key)).unwrap(), frame);
        assert_eq!(GooseFrame::from_secure_ethernet(&eth, None).unwrap(), frame);

        let err = GooseFrame::from_secure_ethernet(&eth, Some(&[0x43; 48])).unwrap_err();
        assert!(matches!(err, GooseError::Authentication(_)));

        let mut tampered = eth.clone();
        let last = tampered.payload.len() - 40;
        tampered.payload[last] ^= 0x01;
        assert!(matches!(
            GooseFrame::from_secure_ethernet(&tampered, Some(&key)),
            Err(GooseError::Authentication(_)) | Err(GooseError::Decoding(_))
        ));
    }

    #[test]
    fn test_secure_parser_checks_crc() {
        let mut eth = sample_frame().to_secure_ethernet(&[1; 48]).unwrap();
        eth.payload[7] ^= 0xFF;
        let err = GooseFrame::from_secure_ethernet(&eth, None).unwrap_err();
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn test_secure_parser_rejects_plain_frame() {
        let eth = sample_frame().to_ethernet().unwrap();
        assert!(GooseFrame::from_secure_ethernet(&eth, None).is_err());
    }

    #[test]
    fn test_frame_requires_vlan_and_ethertype() {
        let mut eth = sample_frame().to_ethernet().unwrap();
        eth.vlan = None;
        assert!(GooseFrame::from_ethernet(&eth).is_err());

        let mut eth = sample_frame().to_ethernet().unwrap();
        eth.ethertype = 0x0800;
        assert!(GooseFrame::from_ethernet(&eth).is_err());
    }
}
