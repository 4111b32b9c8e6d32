use aero_vhci::{
    Giveback, IsoPacketResult, PortChange, PortFlags, PortStatus, SetupPacket, TransferFlags,
    TransferHandle, TransferStatus, TransferType, TransferWork, Work,
};
use serde_json::json;

fn handle(raw: u64) -> TransferHandle {
    TransferHandle::from_raw(raw).unwrap()
}

#[test]
fn work_is_tagged_by_kind() {
    let cancel = Work::Cancel { handle: handle(7) };
    assert_eq!(
        serde_json::to_value(&cancel).unwrap(),
        json!({ "kind": "cancel", "handle": 7 })
    );

    let update = Work::PortUpdate {
        port: 2,
        status: PortStatus::POWER | PortStatus::CONNECTION,
        change: PortChange::C_CONNECTION,
        flags: PortFlags::empty(),
    };
    assert_eq!(
        serde_json::to_value(&update).unwrap(),
        json!({ "kind": "portUpdate", "port": 2, "status": 0x0101, "change": 1, "flags": 0 })
    );
}

#[test]
fn transfer_work_uses_usb_field_names() {
    let work = Work::ProcessTransfer(TransferWork {
        handle: handle(1),
        address: 5,
        endpoint: 0x80,
        transfer_type: TransferType::Control,
        flags: TransferFlags::SHORT_NOT_OK,
        buffer_length: 18,
        setup: Some(SetupPacket {
            bm_request_type: 0x80,
            b_request: 6,
            w_value: 0x0100,
            w_index: 0,
            w_length: 18,
        }),
        interval: 0,
        packet_count: 0,
    });
    let value = serde_json::to_value(&work).unwrap();
    assert_eq!(value["kind"], "processTransfer");
    assert_eq!(value["transferType"], "control");
    assert_eq!(value["flags"], 1);
    assert_eq!(value["setup"]["bmRequestType"], 0x80);
    assert_eq!(value["setup"]["wLength"], 18);

    let back: Work = serde_json::from_value(value).unwrap();
    assert_eq!(back, work);
}

#[test]
fn giveback_defaults_optional_fields() {
    let parsed: Giveback = serde_json::from_value(json!({
        "handle": 3,
        "status": "stall",
        "actualLength": 0
    }))
    .unwrap();
    assert_eq!(parsed, Giveback::new(handle(3), TransferStatus::Stall));

    let iso: Giveback = serde_json::from_value(json!({
        "handle": 4,
        "status": "success",
        "actualLength": 8,
        "errorCount": 1,
        "isoResults": [
            { "status": "success", "actualLength": 4 },
            { "status": "crc", "actualLength": 0 }
        ],
        "payload": [1, 2, 3, 4, 5, 6, 7, 8]
    }))
    .unwrap();
    assert_eq!(iso.error_count, 1);
    assert_eq!(
        iso.iso_results.unwrap()[1],
        IsoPacketResult {
            status: TransferStatus::Crc,
            actual_length: 0
        }
    );
}

#[test]
fn zero_handle_is_rejected() {
    assert!(serde_json::from_value::<Work>(json!({ "kind": "cancel", "handle": 0 })).is_err());
}
