//! Unsolicited report extension
//!
//! Vendor function `0x41`, subfunction `0x91`, lets the register-holding side push
//! register values without a prior read:
//!
//! ```text
//! [0x91][data_length:u16][reporting_type:u8][device_count:u16]
//!   per device:  [location:u16][segment_count:u16]
//!   per segment: [start:u16][count:u16][count * 2 bytes]
//! ```
//!
//! `data_length` counts every byte after itself. Bit 7 of `reporting_type` asks the
//! peer for a response.

use crate::correlation::PduCorrelationLayer;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{GenericPdu, Pdu, FC_UNSOLICITED_REPORT};
use crate::protocol::{FrameProtocol, MAX_PDU_LEN};
use crate::registers::Registry;
use bytes::{Buf, BufMut};
use std::time::Duration;
use tracing::{debug, trace};

/// Subfunction of [`FC_UNSOLICITED_REPORT`] carrying register reports
pub const SUBFUNCTION_REPORT: u8 = 0x91;

const RESPONSE_REQUIRED: u8 = 0x80;

/// Bytes a request needs before the first device: function code, subfunction,
/// data length, reporting type, device count
const REQUEST_OVERHEAD: usize = 1 + 1 + 2 + 1 + 2;
const DEVICE_OVERHEAD: usize = 4;
const SEGMENT_OVERHEAD: usize = 4;

/// Contiguous run of registers in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub registers_start: u16,
    pub registers_count: u16,
    pub registers: Vec<u8>,
}

impl Segment {
    pub fn new(registers_start: u16, registers: Vec<u8>) -> Self {
        Self {
            registers_start,
            registers_count: (registers.len() / 2) as u16,
            registers,
        }
    }

    fn end(&self) -> u32 {
        self.registers_start as u32 + self.registers_count as u32
    }

    fn encoded_len(&self) -> usize {
        SEGMENT_OVERHEAD + self.registers.len()
    }
}

/// Segments reported for one location
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Device {
    pub location: u16,
    pub segments: Vec<Segment>,
}

impl Device {
    pub fn new(location: u16, segments: Vec<Segment>) -> Self {
        Self { location, segments }
    }

    /// Merge segments where one ends exactly where another starts
    ///
    /// Rescans from the beginning after every merge until a full pass merges nothing.
    pub fn defragment(&mut self) {
        'scan: loop {
            for i in 0..self.segments.len() {
                for j in 0..self.segments.len() {
                    if i == j {
                        continue;
                    }
                    let (a, b) = (&self.segments[i], &self.segments[j]);
                    if a.end() != b.registers_start as u32
                        || a.registers_count as u32 + b.registers_count as u32 > u16::MAX as u32
                    {
                        continue;
                    }
                    let next = self.segments.remove(j);
                    let target = if j < i { i - 1 } else { i };
                    let merged = &mut self.segments[target];
                    merged.registers_count += next.registers_count;
                    merged.registers.extend_from_slice(&next.registers);
                    continue 'scan;
                }
            }
            break;
        }
    }

    fn encoded_len(&self) -> usize {
        DEVICE_OVERHEAD + self.segments.iter().map(Segment::encoded_len).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnsolicitedReportRequest {
    pub response_required: bool,
    pub devices: Vec<Device>,
}

impl UnsolicitedReportRequest {
    pub fn defragment(&mut self) {
        for device in &mut self.devices {
            device.defragment();
        }
    }

    pub fn encoded_len(&self) -> usize {
        REQUEST_OVERHEAD + self.devices.iter().map(Device::encoded_len).sum::<usize>()
    }

    /// Split into requests whose PDU fits in `max_pdu_len` bytes
    ///
    /// A single segment larger than the limit still ends up alone in a request and
    /// fails at encoding time.
    pub fn split(self, max_pdu_len: usize) -> Vec<UnsolicitedReportRequest> {
        if self.encoded_len() <= max_pdu_len {
            return vec![self];
        }
        let response_required = self.response_required;
        let mut requests = Vec::new();
        let mut current = Self {
            response_required,
            devices: Vec::new(),
        };
        for device in self.devices {
            let mut chunk = Device::new(device.location, Vec::new());
            for segment in device.segments {
                let added = segment.encoded_len()
                    + if chunk.segments.is_empty() { DEVICE_OVERHEAD } else { 0 };
                let pending = current.encoded_len()
                    + if chunk.segments.is_empty() { 0 } else { chunk.encoded_len() };
                if pending + added > max_pdu_len
                    && (!chunk.segments.is_empty() || !current.devices.is_empty())
                {
                    if !chunk.segments.is_empty() {
                        current.devices.push(std::mem::replace(
                            &mut chunk,
                            Device::new(device.location, Vec::new()),
                        ));
                    }
                    requests.push(std::mem::replace(
                        &mut current,
                        Self {
                            response_required,
                            devices: Vec::new(),
                        },
                    ));
                }
                chunk.segments.push(segment);
            }
            if !chunk.segments.is_empty() {
                current.devices.push(chunk);
            }
        }
        if !current.devices.is_empty() {
            requests.push(current);
        }
        requests
    }
}

impl Pdu for UnsolicitedReportRequest {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        let mut body = Vec::with_capacity(self.encoded_len());
        body.put_u8(if self.response_required { RESPONSE_REQUIRED } else { 0 });
        body.put_u16(self.devices.len() as u16);
        for device in &self.devices {
            body.put_u16(device.location);
            body.put_u16(device.segments.len() as u16);
            for segment in &device.segments {
                if segment.registers.len() != segment.registers_count as usize * 2 {
                    return Err(ModbusError::encoding(format!(
                        "segment at 0x{:04X} declares {} registers but carries {} bytes",
                        segment.registers_start,
                        segment.registers_count,
                        segment.registers.len()
                    )));
                }
                body.put_u16(segment.registers_start);
                body.put_u16(segment.registers_count);
                body.put_slice(&segment.registers);
            }
        }
        if body.len() > u16::MAX as usize {
            return Err(ModbusError::encoding("unsolicited report too large"));
        }

        let mut data = Vec::with_capacity(3 + body.len());
        data.put_u8(SUBFUNCTION_REPORT);
        data.put_u16(body.len() as u16);
        data.put_slice(&body);
        Ok(GenericPdu::new(FC_UNSOLICITED_REPORT, data))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        let mut buf = report_body(pdu)?;
        let truncated = |what: &str| ModbusError::decoding(format!("truncated {}", what), pdu);

        if buf.remaining() < 3 {
            return Err(truncated("report header"));
        }
        let response_required = buf.get_u8() & RESPONSE_REQUIRED != 0;
        let device_count = buf.get_u16();

        let mut devices = Vec::with_capacity(device_count as usize);
        for _ in 0..device_count {
            if buf.remaining() < DEVICE_OVERHEAD {
                return Err(truncated("device header"));
            }
            let location = buf.get_u16();
            let segment_count = buf.get_u16();
            let mut segments = Vec::with_capacity(segment_count as usize);
            for _ in 0..segment_count {
                if buf.remaining() < SEGMENT_OVERHEAD {
                    return Err(truncated("segment header"));
                }
                let registers_start = buf.get_u16();
                let registers_count = buf.get_u16();
                let len = registers_count as usize * 2;
                if buf.remaining() < len {
                    return Err(truncated("segment registers"));
                }
                let registers = buf[..len].to_vec();
                buf.advance(len);
                segments.push(Segment {
                    registers_start,
                    registers_count,
                    registers,
                });
            }
            devices.push(Device { location, segments });
        }
        if buf.has_remaining() {
            return Err(ModbusError::decoding(
                format!("{} trailing bytes after last device", buf.remaining()),
                pdu,
            ));
        }
        Ok(Self {
            response_required,
            devices,
        })
    }
}

/// Acknowledgement of a report that required a response
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnsolicitedReportResponse;

impl Pdu for UnsolicitedReportResponse {
    fn to_generic(&self) -> ModbusResult<GenericPdu> {
        Ok(GenericPdu::new(
            FC_UNSOLICITED_REPORT,
            vec![SUBFUNCTION_REPORT, 0x00, 0x00],
        ))
    }

    fn from_generic(pdu: &GenericPdu) -> ModbusResult<Self> {
        // Any payload after the length field is acknowledged but not interpreted
        report_body(pdu)?;
        Ok(Self)
    }
}

/// Validate function code, subfunction and data length; return the body
fn report_body(pdu: &GenericPdu) -> ModbusResult<&[u8]> {
    if pdu.function_code != FC_UNSOLICITED_REPORT {
        return Err(ModbusError::decoding("not an unsolicited report", pdu));
    }
    let mut buf = pdu.data.as_slice();
    if buf.remaining() < 3 {
        return Err(ModbusError::decoding("truncated report prefix", pdu));
    }
    let subfunction = buf.get_u8();
    if subfunction != SUBFUNCTION_REPORT {
        return Err(ModbusError::decoding(
            format!("unexpected subfunction 0x{:02X}", subfunction),
            pdu,
        ));
    }
    let data_length = buf.get_u16() as usize;
    if data_length != buf.remaining() {
        return Err(ModbusError::decoding(
            format!(
                "declared data length {} but {} bytes follow",
                data_length,
                buf.remaining()
            ),
            pdu,
        ));
    }
    Ok(buf)
}

impl Registry {
    /// Build a report from every register due for reporting, `None` if nothing is due
    pub fn unsolicited_report(
        &self,
        location: u16,
        response_required: bool,
    ) -> Option<UnsolicitedReportRequest> {
        let segments = self.take_report_segments();
        if segments.is_empty() {
            return None;
        }
        let mut device = Device::new(location, segments);
        device.defragment();
        trace!(
            "Unsolicited report for location {}: {} segments",
            location,
            device.segments.len()
        );
        Some(UnsolicitedReportRequest {
            response_required,
            devices: vec![device],
        })
    }
}

/// Send a report, waiting for the acknowledgement if one is required
pub fn send_unsolicited_report<P: FrameProtocol>(
    layer: &PduCorrelationLayer<P>,
    request: &UnsolicitedReportRequest,
    timeout: Duration,
) -> ModbusResult<()> {
    for part in request.clone().split(MAX_PDU_LEN) {
        let pdu = part.to_generic()?;
        if part.response_required {
            let response = layer.request_response(&pdu, timeout)?;
            UnsolicitedReportResponse::from_generic(&response)?;
        } else {
            layer.request_without_response(&pdu)?;
        }
        debug!(
            "Sent unsolicited report ({} devices, {} bytes)",
            part.devices.len(),
            pdu.wire_len()
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;

    fn segment(start: u16, words: &[u16]) -> Segment {
        Segment::new(start, words.iter().flat_map(|w| w.to_be_bytes()).collect())
    }

    #[test]
    fn test_encoding_layout() {
        let request = UnsolicitedReportRequest {
            response_required: true,
            devices: vec![Device::new(1, vec![segment(0x110B, &[0x0003])])],
        };
        let pdu = request.to_generic().unwrap();
        assert_eq!(pdu.function_code, 0x41);
        assert_eq!(
            pdu.data,
            vec![
                0x91, 0x00, 0x0D, // subfunction, data length
                0x80, 0x00, 0x01, // reporting type, device count
                0x00, 0x01, 0x00, 0x01, // location, segment count
                0x11, 0x0B, 0x00, 0x01, 0x00, 0x03, // segment
            ]
        );
        assert_eq!(request.encoded_len(), pdu.wire_len());
    }

    #[test]
    fn test_round_trip() {
        let mut request = UnsolicitedReportRequest {
            response_required: false,
            devices: vec![
                Device::new(0, vec![segment(0x3001, &[0, 1]), segment(0x1024, &[0x6543, 0x2100])]),
                Device::new(7, vec![]),
            ],
        };
        request.defragment();
        let decoded =
            UnsolicitedReportRequest::from_generic(&request.to_generic().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_encoding_rejects_inconsistent_segment() {
        let mut bad = segment(0x10, &[1, 2]);
        bad.registers_count = 3;
        let request = UnsolicitedReportRequest {
            response_required: false,
            devices: vec![Device::new(0, vec![bad])],
        };
        assert!(matches!(request.to_generic(), Err(ModbusError::Encoding(_))));
    }

    #[test]
    fn test_decoding_rejects_truncated_segment() {
        let request = UnsolicitedReportRequest {
            response_required: false,
            devices: vec![Device::new(0, vec![segment(0x10, &[1, 2])])],
        };
        let mut pdu = request.to_generic().unwrap();
        pdu.data.pop();
        // Keep the declared length consistent so the segment check is what fails
        let body_len = (pdu.data.len() - 3) as u16;
        pdu.data[1..3].copy_from_slice(&body_len.to_be_bytes());
        match UnsolicitedReportRequest::from_generic(&pdu) {
            Err(ModbusError::Decoding { message, pdu: carried }) => {
                assert!(message.contains("segment registers"));
                assert_eq!(carried, pdu);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decoding_rejects_length_mismatch_and_subfunction() {
        let pdu = GenericPdu::new(0x41, vec![0x91, 0x00, 0x05, 0x00, 0x00, 0x00]);
        assert!(UnsolicitedReportRequest::from_generic(&pdu).is_err());
        let pdu = GenericPdu::new(0x41, vec![0x92, 0x00, 0x03, 0x00, 0x00, 0x00]);
        assert!(UnsolicitedReportRequest::from_generic(&pdu).is_err());
        let pdu = GenericPdu::new(0x41, vec![0x91, 0x00, 0x03, 0x00, 0x00, 0x00]);
        assert!(UnsolicitedReportRequest::from_generic(&pdu).is_ok());
    }

    #[test]
    fn test_defragment_merges_chains_in_any_order() {
        let mut device = Device::new(
            0,
            vec![
                segment(0x14, &[5]),
                segment(0x10, &[1, 2]),
                segment(0x20, &[9]),
                segment(0x12, &[3, 4]),
            ],
        );
        device.defragment();
        assert_eq!(device.segments.len(), 2);
        let merged = device
            .segments
            .iter()
            .find(|s| s.registers_start == 0x10)
            .unwrap();
        assert_eq!(merged.registers_count, 5);
        assert_eq!(merged.registers, segment(0x10, &[1, 2, 3, 4, 5]).registers);

        let once = device.clone();
        device.defragment();
        assert_eq!(device, once);
        for a in &device.segments {
            for b in &device.segments {
                assert_ne!(a.end(), b.registers_start as u32);
            }
        }
    }

    #[test]
    fn test_split_respects_pdu_limit() {
        let segments: Vec<_> = (0..40u16).map(|i| segment(i * 0x10, &[i, i])).collect();
        let request = UnsolicitedReportRequest {
            response_required: true,
            devices: vec![Device::new(3, segments)],
        };
        let parts = request.clone().split(MAX_PDU_LEN);
        assert!(parts.len() > 1);
        let mut total = 0;
        for part in &parts {
            assert!(part.encoded_len() <= MAX_PDU_LEN);
            assert!(part.response_required);
            assert_eq!(part.devices[0].location, 3);
            total += part.devices.iter().map(|d| d.segments.len()).sum::<usize>();
        }
        assert_eq!(total, 40);
    }
}
