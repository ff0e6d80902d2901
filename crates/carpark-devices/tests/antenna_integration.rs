//! Antenna driver against a scripted antenna.

mod common;

use carpark_core::{AntennaConfig, DeviceKind, Error, FailureReason, IuNumber, TimingConfig};
use carpark_devices::{AntennaHandle, DeviceEvent};
use carpark_protocol::AntennaCommand;
use carpark_protocol::antenna::CATEGORY_IU;
use common::{antenna_line, antenna_reply, drain_events, events, iu_data, next_event};
use tokio::time::Instant;

const IU: &str = "1234567890";

#[tokio::test(start_paused = true)]
async fn test_iu_confirmed_after_two_reads() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.start_scanning();

    for _ in 0..2 {
        let request = antenna.expect_frame().await;
        assert_eq!((request.category, request.command), (CATEGORY_IU, 0x20));
        antenna.send(&antenna_reply(&request, &iu_data(IU))).await;
    }

    let expected = IuNumber::new(IU).unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::IuArrived {
            iu: expected.clone()
        }
    );

    // accepted IU ends the scan
    assert!(antenna.drain_frames().await.is_empty());
    assert!(drain_events(&mut rx).await.is_empty());
    assert_eq!(handle.last_iu(), Some(expected));
    assert!(!handle.is_scanning());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_changed_iu_restarts_count() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.start_scanning();

    let reads = ["1111111111", "2222222222", "2222222222"];
    for digits in reads {
        let request = antenna.expect_frame().await;
        antenna.send(&antenna_reply(&request, &iu_data(digits))).await;
    }

    let events = drain_events(&mut rx).await;
    assert_eq!(
        events,
        vec![DeviceEvent::IuArrived {
            iu: IuNumber::new("2222222222").unwrap()
        }]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_iu_polls_until_found() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.start_scanning();

    for _ in 0..3 {
        let request = antenna.expect_frame().await;
        antenna.send(&antenna_reply(&request, &[0x01])).await;
    }
    for _ in 0..2 {
        let request = antenna.expect_frame().await;
        antenna.send(&antenna_reply(&request, &iu_data(IU))).await;
    }

    assert!(matches!(
        next_event(&mut rx).await,
        DeviceEvent::IuArrived { .. }
    ));
    assert!(antenna.drain_frames().await.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poll_attempts_bounded() {
    let config = AntennaConfig {
        timing: TimingConfig {
            max_poll_attempts: 3,
            ..TimingConfig::default()
        },
        ..AntennaConfig::default()
    };
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&config, host, tx);

    handle.start_scanning();

    for _ in 0..3 {
        let request = antenna.expect_frame().await;
        antenna.send(&antenna_reply(&request, &[0x01])).await;
    }

    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::DeviceFault {
            device: DeviceKind::Antenna,
            command: "ForceGetIU",
            reason: FailureReason::PollExhausted,
        }
    );
    assert!(antenna.drain_frames().await.is_empty());
    assert!(!handle.is_scanning());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scan_stopped_at_poll_ceiling_is_not_a_fault() {
    let config = AntennaConfig {
        timing: TimingConfig {
            max_poll_attempts: 2,
            ..TimingConfig::default()
        },
        ..AntennaConfig::default()
    };
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&config, host, tx);

    handle.start_scanning();
    let request = antenna.expect_frame().await;
    antenna.send(&antenna_reply(&request, &[0x01])).await;

    // the last allowed poll is answered after the scan was stopped
    let request = antenna.expect_frame().await;
    handle.stop_scanning();
    antenna.send(&antenna_reply(&request, &[0x01])).await;

    let stop = antenna.expect_frame().await;
    assert_eq!(stop.command, AntennaCommand::StopIu.code());
    antenna.send(&antenna_reply(&stop, &[0x00])).await;

    let events = drain_events(&mut rx).await;
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, DeviceEvent::DeviceFault { .. })),
        "{events:?}"
    );
    assert!(antenna.drain_frames().await.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_antenna_faults_after_retries() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let config = AntennaConfig::default();
    let handle = AntennaHandle::spawn(&config, host, tx);

    handle.get_status();

    let sends = antenna.drain_frames().await;
    assert_eq!(sends.len(), config.timing.max_retries as usize + 1);
    assert_eq!(
        drain_events(&mut rx).await,
        vec![DeviceEvent::DeviceFault {
            device: DeviceKind::Antenna,
            command: "GetAntennaStatus",
            reason: FailureReason::NoResponse,
        }]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_power_status_reported() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.set_antenna_data(12, 3);
    let request = antenna.expect_frame().await;
    assert_eq!(&request.data[..], &[12, 3]);
    antenna.send(&antenna_reply(&request, &[0x00])).await;

    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::PowerStatus {
            device: DeviceKind::Antenna,
            powered: true,
        }
    );
    assert_eq!(
        next_event(&mut rx).await.to_string(),
        "Antenna SetAntennaData ok power=12,channel=3"
    );
    assert!(handle.is_powered());

    handle.set_antenna_data(99, 3);
    let request = antenna.expect_frame().await;
    antenna.send(&antenna_reply(&request, &[0x05])).await;

    assert!(matches!(
        next_event(&mut rx).await,
        DeviceEvent::CommandFailed {
            reason: FailureReason::Nak,
            ..
        }
    ));
    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::PowerStatus {
            device: DeviceKind::Antenna,
            powered: false,
        }
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_reply_recovered_by_retry() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.get_status();

    let request = antenna.expect_frame().await;
    // DLE STX body DLE ETX with a bad CRC
    antenna
        .send_raw(&[0x10, 0x02, 0x01, 0x80, 0x01, 0x10, 0x03, 0xDE, 0xAD])
        .await;
    let rejected_at = Instant::now();

    // resent once the line is quiet, well before the response timeout
    let request_again = antenna.expect_frame().await;
    assert_eq!(request_again.command, request.command);
    assert!(rejected_at.elapsed() < TimingConfig::default().response_timeout());
    antenna
        .send(&antenna_reply(&request_again, &[0x00, 7, 2]))
        .await;

    assert_eq!(
        next_event(&mut rx).await.to_string(),
        "Antenna GetAntennaStatus ok power=7,channel=2"
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_line_loss_reported_as_fault() {
    let (host, mut antenna) = antenna_line();
    let (tx, mut rx) = events();
    let handle = AntennaHandle::spawn(&AntennaConfig::default(), host, tx);

    handle.get_status();
    antenna.expect_frame().await;
    drop(antenna);

    assert_eq!(
        next_event(&mut rx).await,
        DeviceEvent::DeviceFault {
            device: DeviceKind::Antenna,
            command: "GetAntennaStatus",
            reason: FailureReason::Disconnected,
        }
    );
    assert!(matches!(
        handle.shutdown().await,
        Err(Error::Disconnected(_))
    ));
}
