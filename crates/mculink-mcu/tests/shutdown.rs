mod common;

use std::time::Duration;

use common::{connect, FirmwareConfig};
use mculink_dict::ParamValue;
use mculink_mcu::McuError;
use mculink_queue::{LinkState, QueueError};

#[test]
fn emergency_stop_reports_shutdown() {
    let (mcu, firmware) = connect(FirmwareConfig::default());
    let events = mcu.shutdown_events();
    mcu.emergency_stop().unwrap();

    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.mcu, "mcu");
    assert_eq!(event.event_type, "shutdown");
    assert_eq!(event.reason, "Command request");
    assert!(event.hint.is_some());
    assert!(event.clock.is_some());
    assert!(firmware.log().shutdown);

    assert!(mcu.is_shutdown());
    assert_eq!(mcu.shutdown_event().unwrap().reason, "Command request");
    assert_eq!(mcu.handler().queue().link_state(), LinkState::Shutdown);

    let heater = mcu.lookup_command("heater_set oid=%c value=%u").unwrap();
    let err = heater
        .send(&[ParamValue::Int(1), ParamValue::Int(10)], 0, 0)
        .unwrap_err();
    assert!(matches!(err, McuError::Queue(QueueError::Shutdown)));

    // urgent traffic still flows; a second stop does not emit another event
    mcu.emergency_stop().unwrap();
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn lost_firmware_fails_connect_with_name() {
    let (stream, firmware) = common::spawn_firmware(FirmwareConfig::default());
    drop(firmware);
    let config = mculink_mcu::McuConfig {
        response_timeout: Duration::from_millis(300),
        retry_interval: Duration::from_millis(100),
        ..common::test_config("aux")
    };
    let err = mculink_mcu::Mcu::connect_stream(stream, config).unwrap_err();
    assert!(err.to_string().contains("'aux'"), "{err}");
}
