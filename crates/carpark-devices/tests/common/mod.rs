//! Scripted peripheral on the far end of a simulated serial line.
//!
//! Tests spawn a device driver over one half of a `tokio::io::duplex` pair
//! and play the peripheral on the other half with an [`Emulator`]: read the
//! host's request frames, answer with frames built by the reply helpers
//! below, or stay silent to exercise timeouts.
//!
//! Run these tests with `start_paused = true`. Every wait here is bounded
//! by a tokio timer, so paused time moves straight to the next deadline.

#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use carpark_core::constants::{KSM_NEGATIVE, KSM_POSITIVE};
use carpark_devices::DeviceEvent;
use carpark_protocol::bcd;
use carpark_protocol::{
    AntennaFrame, AntennaFramer, FrameCodec, Framer, Inbound, KsmFrame, KsmFramer, LcscFrame,
    LcscFramer,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Decoder;

/// Longer than any retry cycle with default timing.
pub const QUIET: Duration = Duration::from_secs(5);

/// Capacity of the simulated line.
const LINE_BUFFER: usize = 4096;

pub struct Emulator<F: Framer> {
    stream: DuplexStream,
    codec: FrameCodec<F>,
    buffer: BytesMut,
}

impl<F: Framer> Emulator<F> {
    pub fn new(stream: DuplexStream, framer: F) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(framer),
            buffer: BytesMut::new(),
        }
    }

    /// Next complete frame from the host, or `None` once the host hung up.
    pub async fn next_frame(&mut self) -> Option<F::Frame> {
        loop {
            while let Some(item) = self.codec.decode(&mut self.buffer).ok()? {
                if let Inbound::Frame(frame) = item {
                    return Some(frame);
                }
            }
            if self.stream.read_buf(&mut self.buffer).await.ok()? == 0 {
                return None;
            }
        }
    }

    /// Next frame, unless the host stays quiet for `limit`.
    pub async fn frame_within(&mut self, limit: Duration) -> Option<F::Frame> {
        timeout(limit, self.next_frame()).await.ok().flatten()
    }

    /// Next frame, failing the test if none arrives.
    pub async fn expect_frame(&mut self) -> F::Frame {
        self.frame_within(QUIET)
            .await
            .expect("host sent no frame")
    }

    /// Every frame sent until the host stays quiet for [`QUIET`].
    pub async fn drain_frames(&mut self) -> Vec<F::Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.frame_within(QUIET).await {
            frames.push(frame);
        }
        frames
    }

    /// Next raw byte outside any frame, such as a link control byte.
    pub async fn expect_byte(&mut self) -> u8 {
        while self.buffer.is_empty() {
            let read = timeout(QUIET, self.stream.read_buf(&mut self.buffer))
                .await
                .expect("host sent no byte")
                .expect("line closed");
            assert!(read > 0, "line closed");
        }
        self.buffer.get_u8()
    }

    pub async fn send(&mut self, frame: &F::Frame) {
        let bytes = self.codec.encode_frame(frame).expect("encodable reply");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("line open");
    }
}

/// Host side and emulator side of a fresh line.
pub fn line<F: Framer>(framer: F) -> (DuplexStream, Emulator<F>) {
    let (host, device) = tokio::io::duplex(LINE_BUFFER);
    (host, Emulator::new(device, framer))
}

pub fn antenna_line() -> (DuplexStream, Emulator<AntennaFramer>) {
    line(AntennaFramer::default())
}

pub fn ksm_line() -> (DuplexStream, Emulator<KsmFramer>) {
    line(KsmFramer::new())
}

pub fn lcsc_line() -> (DuplexStream, Emulator<LcscFramer>) {
    line(LcscFramer::default())
}

pub fn events() -> (mpsc::Sender<DeviceEvent>, mpsc::Receiver<DeviceEvent>) {
    mpsc::channel(64)
}

/// Next event, failing the test if none arrives.
pub async fn next_event(rx: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
    timeout(QUIET, rx.recv())
        .await
        .expect("no event emitted")
        .expect("event channel closed")
}

/// Events emitted until the devices stay quiet for [`QUIET`].
pub async fn drain_events(rx: &mut mpsc::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
        events.push(event);
    }
    events
}

/// Antenna reply to `request` with addresses swapped.
pub fn antenna_reply(request: &AntennaFrame, data: &[u8]) -> AntennaFrame {
    AntennaFrame {
        dest: request.src,
        src: request.dest,
        data: Bytes::copy_from_slice(data),
        ..request.clone()
    }
}

/// `ForceGetIU` response data carrying a 10-digit IU.
pub fn iu_data(digits: &str) -> Vec<u8> {
    let mut data = vec![0x00];
    data.extend(bcd::encode_digits(digits).expect("decimal IU"));
    data
}

pub fn ksm_positive(request: &KsmFrame, st1: u8, data: &[u8]) -> KsmFrame {
    let mut body = vec![st1, b'0'];
    body.extend_from_slice(data);
    KsmFrame {
        kind: KSM_POSITIVE,
        cm: request.cm,
        pm: request.pm,
        data: Bytes::from(body),
    }
}

pub fn ksm_negative(request: &KsmFrame, code: &[u8; 2]) -> KsmFrame {
    KsmFrame {
        kind: KSM_NEGATIVE,
        cm: request.cm,
        pm: request.pm,
        data: Bytes::copy_from_slice(code),
    }
}

/// LCSC response echoing the request's type and sequence byte.
pub fn lcsc_reply(request: &LcscFrame, status: u8, data: &[u8]) -> LcscFrame {
    let mut payload = BytesMut::with_capacity(2 + data.len());
    payload.put_u8(request.payload[0]);
    payload.put_u8(status);
    payload.put_slice(data);
    LcscFrame {
        response: true,
        kind: request.kind,
        payload: payload.freeze(),
    }
}
