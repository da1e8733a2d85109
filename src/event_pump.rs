//! The event pump: a background task that polls the interrupt-in endpoint
//! for asynchronous PTP events and republishes them, deduplicated, over an
//! mpsc channel (`spec.md` §4.9).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use num_traits::FromPrimitive;
use tokio::sync::mpsc;

use crate::container::{Container, ContainerType};
use crate::event::{Event, EventCode};
use crate::transport::{Transport, TransportError};

/// How close in time two events with identical code+params must arrive to
/// be treated as the same notification rather than two distinct ones
/// (`spec.md` §4.9 "Coalescing").
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Interrupt packets are small and self-contained: header plus at most 3
/// trailing params, per `spec.md` §3's container shape applied to events.
const INTERRUPT_PACKET_BYTES: usize = 64;

type DedupKey = (u16, Vec<u32>);

/// A running event pump. Dropping it (or calling [`EventPump::stop`])
/// aborts the background task.
pub struct EventPump {
    handle: tokio::task::JoinHandle<()>,
}

impl EventPump {
    /// Spawn the pump. `inactivity_timeout` bounds each individual
    /// `interrupt_in` read; a per-read timeout is not itself fatal — devices
    /// are silent between events — and the pump simply polls again.
    pub fn spawn(transport: Arc<dyn Transport>, inactivity_timeout: Duration, coalesce_window: Duration) -> (EventPump, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(run(transport, inactivity_timeout, coalesce_window, tx));
        (EventPump { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One interrupt-in read, decoded into an event. `Ok(None)` covers both "no
/// data yet" (a timeout, which is the normal idle state) and "a malformed or
/// non-event container arrived" — both are silently skipped rather than
/// treated as pump failures, since a single bad interrupt packet shouldn't
/// take the whole pump down. `Err` is reserved for conditions the pump
/// cannot recover from on its own.
async fn poll_once(transport: &dyn Transport, timeout: Duration) -> Result<Option<Event>, TransportError> {
    let mut buf = [0u8; INTERRUPT_PACKET_BYTES];
    match transport.interrupt_in(&mut buf, timeout).await {
        Ok(0) => Ok(None),
        Ok(n) => Ok(decode_event(&buf[..n])),
        Err(TransportError::TimeoutInPhase(_)) => Ok(None),
        Err(TransportError::Stall) => {
            transport.clear_halt(transport.endpoints().interrupt_in).await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn decode_event(buf: &[u8]) -> Option<Event> {
    let container = Container::decode(buf)?;
    if container.kind != ContainerType::Event {
        return None;
    }
    let code = EventCode::from_u16(container.code)?;
    Some(Event {
        code,
        params: container.params,
    })
}

/// Whether an event at `now` should be forwarded, given the last emitted
/// key and when it was emitted (`spec.md` §4.9 "Coalescing").
fn should_emit(last: &Option<(DedupKey, Instant)>, key: &DedupKey, now: Instant, window: Duration) -> bool {
    match last {
        Some((last_key, at)) => !(last_key == key && now.duration_since(*at) < window),
        None => true,
    }
}

#[tracing::instrument(skip(transport, tx))]
async fn run(transport: Arc<dyn Transport>, timeout: Duration, coalesce_window: Duration, tx: mpsc::Sender<Event>) {
    let mut last: Option<(DedupKey, Instant)> = None;

    loop {
        let event = match poll_once(transport.as_ref(), timeout).await {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                debug!("event pump terminating: {e}");
                return;
            }
        };

        let key = event.dedup_key();
        let now = Instant::now();
        if !should_emit(&last, &key, now, coalesce_window) {
            continue;
        }
        last = Some((key, now));

        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StandardEventCode;
    use crate::testutil::FakeTransport;

    #[test]
    fn decodes_an_object_added_event_container() {
        let bytes = Container::encode(ContainerType::Event, 0x4002, 0, &[0x0001_0002]);
        let event = decode_event(&bytes).unwrap();
        assert_eq!(event.code, EventCode::Standard(StandardEventCode::ObjectAdded));
        assert_eq!(event.object_handle(), Some(0x0001_0002));
    }

    #[test]
    fn non_event_containers_are_not_decoded_as_events() {
        let bytes = Container::encode(ContainerType::Response, 0x2001, 1, &[]);
        assert!(decode_event(&bytes).is_none());
    }

    #[test]
    fn duplicate_within_the_coalescing_window_is_suppressed() {
        let key: DedupKey = (0x4002, vec![1]);
        let t0 = Instant::now();
        let last = Some((key.clone(), t0));

        assert!(!should_emit(&last, &key, t0 + Duration::from_millis(10), Duration::from_millis(50)));
        assert!(should_emit(&last, &key, t0 + Duration::from_millis(60), Duration::from_millis(50)));
    }

    #[test]
    fn a_different_key_is_never_suppressed() {
        let last = Some(((0x4002u16, vec![1]), Instant::now()));
        let other: DedupKey = (0x4003, vec![1]);
        assert!(should_emit(&last, &other, Instant::now(), Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn poll_once_reads_a_queued_event_from_the_transport() {
        let fake = FakeTransport::new();
        let bytes = Container::encode(ContainerType::Event, 0x4003, 0, &[]);
        fake.queue_event(&bytes);

        let event = poll_once(&fake, Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.unwrap().code, EventCode::Standard(StandardEventCode::ObjectRemoved));
    }

    #[tokio::test]
    async fn poll_once_treats_an_empty_queue_as_a_quiet_tick() {
        let fake = FakeTransport::new();
        let event = poll_once(&fake, Duration::from_millis(10)).await.unwrap();
        assert!(event.is_none());
    }
}
