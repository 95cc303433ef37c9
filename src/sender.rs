//! Producer side of the data channel.
//!
//! A [`DataSender`] owns one connection to one collector. Events are queued
//! on a bounded channel and written by a dedicated tokio task, so the
//! acquisition thread only pays for an `Arc` clone and a channel send. When
//! the queue is full the caller blocks: a slow collector throttles its
//! producers instead of growing memory.

use crate::transport::{write_frame, Hello, PeerKind};
use daq_core::codec;
use daq_core::error::{DaqError, DaqResult};
use daq_core::event::EventRef;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

enum Outbound {
    Event(EventRef),
    Flush(oneshot::Sender<DaqResult<()>>),
}

pub struct DataSender {
    collector: String,
    endpoint: String,
    tx: mpsc::Sender<Outbound>,
}

impl DataSender {
    /// Connect to the collector listening on `addr` and introduce this
    /// producer.
    pub async fn connect(
        collector: &str,
        addr: &str,
        producer: &str,
        capacity: usize,
    ) -> DaqResult<Self> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| {
            DaqError::Disconnected(format!("cannot reach collector '{}' at {}: {}", collector, addr, e))
        })?;
        stream.set_nodelay(true)?;
        Hello::new(PeerKind::Producer, producer)
            .send(&mut stream)
            .await?;
        info!(collector, addr, producer, "data channel open");

        let mut sender = Self::from_writer(collector, stream, capacity);
        sender.endpoint = addr.to_string();
        Ok(sender)
    }

    /// Drive an already established byte stream. Must be called from inside
    /// a tokio runtime.
    pub fn from_writer<W>(collector: &str, writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let name = collector.to_string();
        // Dropping the sender closes the queue; the writer drains it, then
        // shuts the connection down.
        tokio::spawn(write_loop(name, writer, rx));
        Self {
            collector: collector.to_string(),
            endpoint: String::new(),
            tx,
        }
    }

    pub fn collector(&self) -> &str {
        &self.collector
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue an event, waiting while the queue is full.
    pub async fn send(&self, ev: EventRef) -> DaqResult<()> {
        self.tx
            .send(Outbound::Event(ev))
            .await
            .map_err(|_| self.disconnected())
    }

    /// Queue an event from a plain thread. Must not be called from inside
    /// the async runtime.
    pub fn send_blocking(&self, ev: EventRef) -> DaqResult<()> {
        self.tx
            .blocking_send(Outbound::Event(ev))
            .map_err(|_| self.disconnected())
    }

    /// Wait until every event queued so far has been written and flushed.
    pub async fn flush(&self) -> DaqResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Flush(ack_tx))
            .await
            .map_err(|_| self.disconnected())?;
        ack_rx.await.map_err(|_| self.disconnected())?
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn disconnected(&self) -> DaqError {
        DaqError::Disconnected(format!("data channel to '{}' closed", self.collector))
    }
}

impl std::fmt::Debug for DataSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSender")
            .field("collector", &self.collector)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn write_loop<W>(collector: String, mut writer: W, mut rx: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Event(ev) => {
                let payload = codec::encode(&ev);
                if let Err(e) = write_frame(&mut writer, &payload).await {
                    error!(collector = %collector, error = %e, "data channel write failed");
                    break;
                }
                written += 1;
            }
            Outbound::Flush(ack) => {
                let result = writer.flush().await.map_err(DaqError::from);
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    error!(collector = %collector, "data channel flush failed");
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!(collector = %collector, written, "data channel writer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::read_frame;
    use daq_core::event::Event;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (a, mut b) = tokio::io::duplex(4096);
        let sender = DataSender::from_writer("dc", a, 4);

        for n in 0..3 {
            let mut ev = Event::new("Test");
            ev.set_event_number(n);
            sender.send(ev.into_ref()).await.unwrap();
        }
        sender.flush().await.unwrap();

        for n in 0..3 {
            let frame = read_frame(&mut b, 1024).await.unwrap().unwrap();
            assert_eq!(codec::decode(&frame).unwrap().event_number(), n);
        }
    }

    #[tokio::test]
    async fn dropped_sender_delivers_queued_events_then_closes() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let sender = DataSender::from_writer("dc", a, 16);
        for n in 0..5 {
            let mut ev = Event::new("Test");
            ev.set_event_number(n);
            sender.send(ev.into_ref()).await.unwrap();
        }
        drop(sender);

        for n in 0..5 {
            let frame = read_frame(&mut b, 1024).await.unwrap().unwrap();
            assert_eq!(codec::decode(&frame).unwrap().event_number(), n);
        }
        assert!(read_frame(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_disconnected() {
        let (a, b) = tokio::io::duplex(16);
        drop(b);
        let sender = DataSender::from_writer("dc", a, 1);

        let mut failed = false;
        for _ in 0..8 {
            if sender.send(Event::new("Test").into_ref()).await.is_err() {
                failed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(failed || sender.flush().await.is_err());
    }
}
