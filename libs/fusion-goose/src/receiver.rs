//! Classification of incoming link-layer frames

use crate::error::{GooseError, GooseResult};
use crate::ethernet::{EthernetFrame, MacAddress};
use crate::frame::{GooseFrame, GOOSE_ETHERTYPE};
use tracing::trace;

/// A decoded GOOSE frame together with the raw frame it came from
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: GooseFrame,
    pub secure: bool,
    raw: EthernetFrame,
}

impl ReceivedFrame {
    /// Check the HMAC of a secure frame with `key`; plain frames always fail
    pub fn verify(&self, key: &[u8]) -> GooseResult<()> {
        if !self.secure {
            return Err(GooseError::Authentication(
                "plain frame carries no HMAC".to_string(),
            ));
        }
        GooseFrame::from_secure_ethernet(&self.raw, Some(key)).map(|_| ())
    }
}

/// Decode `bytes` if it is a GOOSE frame from another station.
///
/// Frames with a foreign ethertype or our own source address yield `Ok(None)`.
/// Secure decoding is tried first; plain frames are accepted only when
/// `allow_unsecured` is set.
pub fn decode_incoming(
    bytes: &[u8],
    local_mac: MacAddress,
    allow_unsecured: bool,
) -> GooseResult<Option<ReceivedFrame>> {
    let raw = EthernetFrame::from_bytes(bytes)?;
    if raw.ethertype != GOOSE_ETHERTYPE {
        return Ok(None);
    }
    if raw.source == local_mac {
        trace!("Ignoring own frame");
        return Ok(None);
    }

    let secure_error = match GooseFrame::from_secure_ethernet(&raw, None) {
        Ok(frame) => {
            return Ok(Some(ReceivedFrame {
                frame,
                secure: true,
                raw,
            }))
        },
        Err(e) => e,
    };
    if !allow_unsecured {
        return Err(secure_error);
    }
    let frame = GooseFrame::from_ethernet(&raw)?;
    Ok(Some(ReceivedFrame {
        frame,
        secure: false,
        raw,
    }))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use crate::ethernet::VlanTag;
    use crate::messages::{GooseMessage, StopChargeReason, StopChargeRequest};

    const LOCAL: MacAddress = MacAddress([2, 0, 0, 0, 0, 1]);
    const PEER: MacAddress = MacAddress([2, 0, 0, 0, 0, 2]);

    fn frame(source: MacAddress) -> GooseFrame {
        GooseFrame {
            destination: LOCAL,
            source,
            vlan: VlanTag::new(5, 0),
            appid: 0x3002,
            pdu: StopChargeRequest {
                charging_connector_no: 1,
                charging_sn: 0xFFFF,
                reason: StopChargeReason::Normal,
            }
            .to_pdu(),
        }
    }

    #[test]
    fn test_secure_frame_and_verification() {
        let bytes = frame(PEER).to_bytes(Some(&[7; 48])).unwrap();
        let received = decode_incoming(&bytes, LOCAL, false).unwrap().unwrap();
        assert!(received.secure);
        received.verify(&[7; 48]).unwrap();
        assert!(matches!(received.verify(&[8; 48]), Err(GooseError::Authentication(_))));
    }

    #[test]
    fn test_plain_frame_needs_permission() {
        let bytes = frame(PEER).to_bytes(None).unwrap();
        assert!(decode_incoming(&bytes, LOCAL, false).is_err());
        let received = decode_incoming(&bytes, LOCAL, true).unwrap().unwrap();
        assert!(!received.secure);
        assert!(received.verify(&[7; 48]).is_err());
    }

    #[test]
    fn test_own_and_foreign_frames_ignored() {
        let bytes = frame(LOCAL).to_bytes(None).unwrap();
        assert!(decode_incoming(&bytes, LOCAL, true).unwrap().is_none());

        let mut ipv4 = vec![0u8; 12];
        ipv4.extend_from_slice(&[0x08, 0x00, 0x45]);
        assert!(decode_incoming(&ipv4, LOCAL, true).unwrap().is_none());
    }
}
