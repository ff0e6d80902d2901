//! Async device task.
//!
//! Each device runs one task that exclusively owns its line and its
//! [`ProtocolEngine`]. Queue notifications, reads, timer deadlines and
//! cancellation are multiplexed in a single `select!`, so engine calls for
//! a device never run concurrently.

use crate::engine::{Action, DeviceProtocol, ProtocolEngine, QueueOf, WriteOutcome};
use crate::events::DeviceEvent;
use crate::transport::Transport;
use bytes::BytesMut;
use carpark_core::{Error, Result, TimingConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 1024;

/// Owner's side of a running device task.
pub struct DeviceHandle<P: DeviceProtocol> {
    queue: Arc<QueueOf<P>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl<P: DeviceProtocol> DeviceHandle<P> {
    pub fn enqueue(&self, command: P::Command) {
        self.queue.enqueue(command);
    }

    pub fn queue(&self) -> &Arc<QueueOf<P>> {
        &self.queue
    }

    /// True once the task has stopped, e.g. after the line dropped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for it.
    ///
    /// A write already in progress is allowed to finish.
    ///
    /// # Errors
    /// The error the task ended with, such as `Disconnected`.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Disconnected(format!("{} task panicked: {e}", P::KIND))),
        }
    }
}

/// Start the device task for `protocol` over `transport`.
pub fn spawn<P, T>(
    protocol: P,
    transport: T,
    timing: TimingConfig,
    events: mpsc::Sender<DeviceEvent>,
) -> DeviceHandle<P>
where
    P: DeviceProtocol,
    T: Transport,
{
    let queue = Arc::new(QueueOf::<P>::new());
    let cancel = CancellationToken::new();
    let engine = ProtocolEngine::new(protocol, Arc::clone(&queue), timing);
    let task = tokio::spawn(run(engine, transport, events, cancel.clone()));

    DeviceHandle {
        queue,
        cancel,
        task,
    }
}

async fn run<P, T>(
    mut engine: ProtocolEngine<P>,
    transport: T,
    events: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
) -> Result<()>
where
    P: DeviceProtocol,
    T: Transport,
{
    let (mut reader, mut writer) = tokio::io::split(transport);
    let queue = Arc::clone(engine.queue());
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut actions: VecDeque<Action> = engine.on_command_enqueued(Instant::now()).into();

    info!(device = %P::KIND, "Device task started");

    loop {
        while let Some(action) = actions.pop_front() {
            match action {
                Action::Write(bytes) => {
                    let outcome = write_frame(&mut writer, &bytes, engine.write_timeout()).await;
                    if outcome != WriteOutcome::Completed {
                        warn!(device = %P::KIND, ?outcome, "Write did not complete");
                    }
                    actions.extend(engine.on_write_result(Instant::now(), outcome));
                }
                Action::Emit(event) => deliver(&events, event).await,
            }
        }

        let deadline = engine.next_deadline();
        tokio::select! {
            () = cancel.cancelled() => {
                info!(device = %P::KIND, "Device task stopping");
                return Ok(());
            }
            () = queue.notified() => {
                actions.extend(engine.on_command_enqueued(Instant::now()));
            }
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => return disconnect(&mut engine, &events, "end of stream".to_string()).await,
                Ok(_) => {
                    let data = buffer.split();
                    actions.extend(engine.on_bytes(Instant::now(), &data));
                }
                Err(e) => return disconnect(&mut engine, &events, e.to_string()).await,
            },
            () = sleep_until(deadline) => {
                actions.extend(engine.on_tick(Instant::now()));
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8], limit: Duration) -> WriteOutcome
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    };
    match tokio::time::timeout(limit, write).await {
        Ok(Ok(())) => WriteOutcome::Completed,
        Ok(Err(e)) => WriteOutcome::Failed(e.to_string()),
        Err(_) => WriteOutcome::TimedOut,
    }
}

async fn deliver(events: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) {
    debug!(%event, "Device event");
    if events.send(event).await.is_err() {
        debug!("Event receiver dropped");
    }
}

async fn disconnect<P: DeviceProtocol>(
    engine: &mut ProtocolEngine<P>,
    events: &mpsc::Sender<DeviceEvent>,
    detail: String,
) -> Result<()> {
    for action in engine.on_disconnect(&detail) {
        if let Action::Emit(event) = action {
            deliver(events, event).await;
        }
    }
    Err(Error::Disconnected(format!("{}: {detail}", P::KIND)))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
