//! Dispenser messenger against a power-unit style subscriber on a shared link

#![allow(clippy::disallowed_methods)] // Tests can use unwrap()

use fusion_goose::messages::{POWER_REQUEST_APPID, STOP_CHARGE_APPID};
use fusion_goose::{
    decode_incoming, ConnectorMessenger, GooseMessage, GooseSender, MacAddress, MemoryLink,
    PowerRequirement, PowerRequirementRequest, RequirementType, Retransmission, SenderConfig,
    StopChargeRequest, VlanTag,
};
use std::sync::Arc;
use std::time::Duration;

const DISPENSER_MAC: MacAddress = MacAddress([0x02, 0xD1, 0, 0, 0, 0x01]);
const PSU_MAC: MacAddress = MacAddress([0x02, 0xB0, 0, 0, 0, 0x01]);
const KEY: [u8; 48] = [0x3C; 48];

fn sender(link: &MemoryLink, retransmission: Option<Retransmission>) -> Arc<GooseSender> {
    let sender = Arc::new(GooseSender::new(
        Arc::new(link.clone()),
        SenderConfig {
            vlan: VlanTag::new(5, 0),
            retransmission,
        },
    ));
    sender.start().unwrap();
    sender
}

#[test]
fn secure_mode_never_sends_before_key() {
    let link = MemoryLink::new(DISPENSER_MAC);
    let sender = sender(&link, Some(Retransmission::default()));
    let messengers: Vec<_> = (1..=4)
        .map(|n| ConnectorMessenger::new(sender.clone(), n, true))
        .collect();

    for (i, messenger) in messengers.iter().enumerate() {
        if i % 2 == 0 {
            messenger.on_new_mac_address(PSU_MAC);
        }
        for step in 0..20 {
            match step % 3 {
                0 => messenger.send_power_requirement(PowerRequirement::placeholder()),
                1 => messenger.send_power_requirement(PowerRequirement::new(
                    RequirementType::Charging,
                    step as f32,
                    1.0,
                )),
                _ => messenger.send_stop_request(),
            };
        }
    }

    assert!(!link.wait_sent(1, Duration::from_millis(200)));
    sender.stop();
}

#[test]
fn power_unit_decodes_and_verifies_requests() {
    let link = MemoryLink::new(DISPENSER_MAC);
    let sender = sender(&link, None);
    let messenger = ConnectorMessenger::new(sender.clone(), 2, true);
    messenger.on_new_mac_address(PSU_MAC);
    messenger.set_hmac_key(&KEY);

    messenger.send_power_requirement(PowerRequirement::new(
        RequirementType::PrechargeVoltageOutput,
        100.0,
        1.0,
    ));
    assert!(link.wait_sent(1, Duration::from_secs(2)));
    messenger.send_stop_request();
    assert!(link.wait_sent(2, Duration::from_secs(2)));
    sender.stop();

    let frames = link.take_sent();
    let request = decode_incoming(&frames[0], PSU_MAC, false).unwrap().unwrap();
    request.verify(&KEY).unwrap();
    assert_eq!(request.frame.appid, POWER_REQUEST_APPID);
    let request = PowerRequirementRequest::from_pdu(&request.frame.pdu).unwrap();
    assert_eq!(request.charging_connector_no, 2);
    assert_eq!(request.requirement.voltage, 100.0);

    let stop = decode_incoming(&frames[1], PSU_MAC, false).unwrap().unwrap();
    stop.verify(&KEY).unwrap();
    assert_eq!(stop.frame.appid, STOP_CHARGE_APPID);
    assert_eq!(
        StopChargeRequest::from_pdu(&stop.frame.pdu)
            .unwrap()
            .charging_connector_no,
        2
    );
}

#[test]
fn key_rotation_is_used_for_next_frame() {
    let link = MemoryLink::new(DISPENSER_MAC);
    let sender = sender(&link, None);
    let messenger = ConnectorMessenger::new(sender.clone(), 1, true);
    messenger.on_new_mac_address(PSU_MAC);

    messenger.set_hmac_key(&KEY);
    messenger.send_power_requirement(PowerRequirement::placeholder());
    assert!(link.wait_sent(1, Duration::from_secs(2)));

    let rotated = [0x77u8; 48];
    messenger.set_hmac_key(&rotated);
    messenger.send_power_requirement(PowerRequirement::placeholder());
    assert!(link.wait_sent(2, Duration::from_secs(2)));
    sender.stop();

    let frames = link.take_sent();
    let first = decode_incoming(&frames[0], PSU_MAC, false).unwrap().unwrap();
    let second = decode_incoming(&frames[1], PSU_MAC, false).unwrap().unwrap();
    first.verify(&KEY).unwrap();
    assert!(second.verify(&KEY).is_err());
    second.verify(&rotated).unwrap();
    assert_eq!(second.frame.pdu.st_num, first.frame.pdu.st_num + 1);
}
