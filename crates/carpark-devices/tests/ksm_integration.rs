//! KSM driver against a scripted card reader.

mod common;

use carpark_core::constants::{ACK, ENQ, NAK};
use carpark_core::{DeviceKind, EventFields, FailureReason, KsmConfig};
use carpark_devices::{DeviceEvent, KsmHandle};
use carpark_protocol::{KsmCommand, KsmFrame, KsmFramer};
use common::{Emulator, drain_events, events, ksm_line, ksm_negative, ksm_positive, next_event};

/// Read a request, acknowledge it and wait for the enquiry.
async fn accept_request(reader: &mut Emulator<KsmFramer>) -> (KsmCommand, KsmFrame) {
    let request = reader.expect_frame().await;
    let command = KsmCommand::from_code(request.cm, request.pm).expect("known command");
    reader.send_raw(&[ACK]).await;
    assert_eq!(reader.expect_byte().await, ENQ);
    (command, request)
}

#[tokio::test(start_paused = true)]
async fn test_init_over_ack_and_enquiry() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let handle = KsmHandle::spawn(&KsmConfig::default(), host, tx);

    handle.init();

    let (command, request) = accept_request(&mut reader).await;
    assert_eq!(command, KsmCommand::Init);
    reader.send(&ksm_positive(&request, b'0', &[])).await;

    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::PowerStatus {
            device: DeviceKind::Ksm,
            powered: true,
        }
    );
    assert_eq!(next_event(&mut rx).await.to_string(), "KSM Init ok");
    assert!(handle.session().powered);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_link_nak_resends_request() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let handle = KsmHandle::spawn(&KsmConfig::default(), host, tx);

    handle.get_version();

    reader.expect_frame().await;
    reader.send_raw(&[NAK]).await;

    let (command, request) = accept_request(&mut reader).await;
    assert_eq!(command, KsmCommand::GetVersion);
    reader.send(&ksm_positive(&request, b'0', b"V1.07")).await;

    assert_eq!(
        next_event(&mut rx).await.to_string(),
        "KSM GetVersion ok version=V1.07"
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_ack_faults_after_retries() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let config = KsmConfig::default();
    let handle = KsmHandle::spawn(&config, host, tx);

    handle.get_status();

    let sends = reader.drain_frames().await;
    assert_eq!(sends.len(), config.timing.max_retries as usize + 1);
    assert_eq!(
        drain_events(&mut rx).await,
        vec![DeviceEvent::DeviceFault {
            device: DeviceKind::Ksm,
            command: "GetStatus",
            reason: FailureReason::AckTimeout,
        }]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_detect_card_polls_until_inserted() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let handle = KsmHandle::spawn(&KsmConfig::default(), host, tx);

    handle.detect_card();

    for st1 in [b'0', b'0', b'2'] {
        let (command, request) = accept_request(&mut reader).await;
        assert_eq!(command, KsmCommand::DetectCard);
        reader.send(&ksm_positive(&request, st1, &[])).await;
    }

    assert_eq!(
        drain_events(&mut rx).await,
        vec![DeviceEvent::CommandSucceeded {
            device: DeviceKind::Ksm,
            command: "DetectCard",
            fields: EventFields::new().with("card", "in_position"),
        }]
    );
    assert!(handle.card_present());
    assert!(!handle.session().scanning);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_negative_reply_reported_once() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let handle = KsmHandle::spawn(&KsmConfig::default(), host, tx);

    handle.read_card();

    let (_, request) = accept_request(&mut reader).await;
    reader.send(&ksm_negative(&request, b"40")).await;

    assert_eq!(
        drain_events(&mut rx).await,
        vec![DeviceEvent::CommandFailed {
            device: DeviceKind::Ksm,
            command: "ReadCard",
            reason: FailureReason::Nak,
            detail: "error code 40".to_string(),
        }]
    );
    // a device answer is final
    assert!(reader.drain_frames().await.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_commands_run_in_order() {
    let (host, mut reader) = ksm_line();
    let (tx, mut rx) = events();
    let handle = KsmHandle::spawn(&KsmConfig::default(), host, tx);

    handle.get_status();
    handle.eject_card();

    for expected in [KsmCommand::GetStatus, KsmCommand::EjectCard] {
        let (command, request) = accept_request(&mut reader).await;
        assert_eq!(command, expected);
        reader.send(&ksm_positive(&request, b'1', &[])).await;
    }

    let names: Vec<String> = drain_events(&mut rx)
        .await
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(names, ["KSM GetStatus ok card=at_gate", "KSM EjectCard ok"]);
    assert!(!handle.card_present());

    handle.shutdown().await.unwrap();
}
