//! GOOSE messaging for the FusionCharge dispenser
//!
//! Power requirements and stop-charge requests travel to the power unit as GOOSE
//! publications on raw Ethernet, signed with HMAC-SHA256 once the power unit has
//! handed out a key.
//!
//! - [`ethernet`]: frame layout with 802.1Q tag, the [`LinkLayer`] boundary, [`MemoryLink`]
//! - [`ber`]: the TLV subset GOOSE needs
//! - [`frame`]: GOOSE PDU, plain and secure frames
//! - [`messages`]: typed power-requirement, reply and stop-charge messages
//! - [`sender`]: publisher thread with retransmission and the per-connector messenger
//! - [`receiver`]: classification of incoming frames

pub mod ber;
pub mod error;
pub mod ethernet;
pub mod frame;
pub mod messages;
pub mod receiver;
pub mod sender;

pub use error::{GooseError, GooseResult};
pub use ethernet::{EthernetFrame, LinkLayer, MacAddress, MemoryLink, VlanTag};
pub use frame::{GooseFrame, GoosePdu, GooseTimestamp, GOOSE_ETHERTYPE};
pub use messages::{
    GooseMessage, Mode, PowerRequirement, PowerRequirementRequest, PowerRequirementResponse,
    RequirementResult, RequirementType, StopChargeReason, StopChargeRequest,
};
pub use receiver::{decode_incoming, ReceivedFrame};
pub use sender::{ConnectorMessenger, GooseSender, Retransmission, SenderConfig};
