//! Stop-and-wait session engine
//!
//! One packet is in flight per direction. The initiator sends an Echo and
//! waits for the matching Echo Reply; the responder answers every Echo,
//! piggybacking its own pending bytes on the reply. An initiator with nothing
//! to say still sends empty Echoes so the responder has a packet to answer.

use super::{SessionKey, StreamPipe};
use crate::config::TunnelConfig;
use crate::transport::{Message, PacketSink, TransportError};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// One-shot callback run when a session ends
pub(crate) type Cleanup = Box<dyn FnOnce() + Send>;

/// Which side of the echo exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends Echo Requests (client)
    Initiator,
    /// Answers Echo Requests (server)
    Responder,
}

/// Why a session loop ended
#[derive(Debug)]
enum Exit {
    Closed,
    IdleTimeout,
    InboxClosed,
    Transport(TransportError),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Closed => write!(f, "stream closed"),
            Exit::IdleTimeout => write!(f, "idle timeout"),
            Exit::InboxClosed => write!(f, "host shut down"),
            Exit::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Protocol state for one remote endpoint
pub(crate) struct TunnelSession {
    role: Role,
    key: SessionKey,
    pipe: Arc<StreamPipe>,
    sink: Arc<dyn PacketSink>,
    inbox: mpsc::Receiver<Message>,
    config: Arc<TunnelConfig>,
    cleanup: Option<Cleanup>,
}

impl TunnelSession {
    pub(crate) fn new(
        role: Role,
        key: SessionKey,
        pipe: Arc<StreamPipe>,
        sink: Arc<dyn PacketSink>,
        inbox: mpsc::Receiver<Message>,
        config: Arc<TunnelConfig>,
        cleanup: Cleanup,
    ) -> Self {
        Self {
            role,
            key,
            pipe,
            sink,
            inbox,
            config,
            cleanup: Some(cleanup),
        }
    }

    /// Run the protocol loop on its own task
    pub(crate) fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let exit = match self.role {
                Role::Initiator => self.run_initiator().await,
                Role::Responder => self.run_responder().await,
            };

            match &exit {
                Exit::Transport(_) => warn!("Session {} ended: {}", self.key, exit),
                _ => info!("Session {} ended: {}", self.key, exit),
            }

            let _ = self.pipe.close();
            if let Some(cleanup) = self.cleanup.take() {
                cleanup();
            }
        })
    }

    async fn run_initiator(&mut self) -> Exit {
        let mut seq: u16 = 1;
        let mut unacked: Option<Bytes> = None;
        let mut connected = false;

        loop {
            // Retransmissions resend the retained payload unchanged
            let payload = match unacked.take() {
                Some(payload) => payload,
                None => match self.pipe.drain_outbound(self.config.max_payload) {
                    Ok(payload) => payload,
                    Err(_) => return Exit::Closed,
                },
            };

            let echo = Message::echo(self.key.id, seq, payload.clone());
            if let Err(e) = self.sink.send(self.key.addr, &echo).await {
                return Exit::Transport(e);
            }

            let deadline = Instant::now() + self.config.round_timeout();
            let reply = loop {
                tokio::select! {
                    _ = self.pipe.closed() => return Exit::Closed,
                    _ = sleep_until(deadline) => break None,
                    received = self.inbox.recv() => match received {
                        None => return Exit::InboxClosed,
                        Some(reply) if reply.seq == seq => break Some(reply),
                        Some(stale) => {
                            debug!("Session {}: discarding stale reply seq {}", self.key, stale.seq);
                        }
                    },
                }
            };

            let Some(reply) = reply else {
                debug!("Session {}: retransmitting seq {}", self.key, seq);
                unacked = Some(payload);
                continue;
            };

            if self.pipe.push_inbound(reply.payload).is_err() {
                return Exit::Closed;
            }
            seq = seq.wrapping_add(1);

            if !connected {
                connected = true;
                info!("Connected to {}", self.key);
            }
        }
    }

    async fn run_responder(&mut self) -> Exit {
        let mut last_seq: Option<u16> = None;
        let mut last_reply = Bytes::new();

        loop {
            let echo = tokio::select! {
                _ = self.pipe.closed() => return Exit::Closed,
                received = timeout(self.config.idle_timeout(), self.inbox.recv()) => match received {
                    Err(_) => return Exit::IdleTimeout,
                    Ok(None) => return Exit::InboxClosed,
                    Ok(Some(echo)) => echo,
                },
            };

            let is_new = match last_seq {
                None => true,
                Some(prev) => echo.seq == prev.wrapping_add(1),
            };

            let payload = if is_new {
                let idle = echo.payload.is_empty();
                if self.pipe.push_inbound(echo.payload.clone()).is_err() {
                    return Exit::Closed;
                }
                last_seq = Some(echo.seq);

                let mut outbound = match self.pipe.drain_outbound(self.config.max_payload) {
                    Ok(outbound) => outbound,
                    Err(_) => return Exit::Closed,
                };
                if idle && outbound.is_empty() {
                    // Nothing either way: give the application a moment to write
                    let _ = timeout(self.config.idle_reply_delay(), self.pipe.wait_outbound()).await;
                    outbound = match self.pipe.drain_outbound(self.config.max_payload) {
                        Ok(outbound) => outbound,
                        Err(_) => return Exit::Closed,
                    };
                }

                last_reply = outbound.clone();
                outbound
            } else if Some(echo.seq) == last_seq {
                debug!("Session {}: duplicate seq {}, resending reply", self.key, echo.seq);
                if echo.payload.is_empty() && last_reply.is_empty() {
                    let _ = timeout(self.config.idle_reply_delay(), self.pipe.wait_outbound()).await;
                }
                last_reply.clone()
            } else {
                debug!("Session {}: stale seq {}", self.key, echo.seq);
                Bytes::new()
            };

            if let Err(e) = self.sink.send(self.key.addr, &echo.reply(payload)).await {
                return Exit::Transport(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageKind;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Records every sent message on a channel
    struct ChannelSink {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl PacketSink for ChannelSink {
        async fn send(&self, _to: IpAddr, message: &Message) -> Result<(), TransportError> {
            self.tx.send(message.clone()).map_err(|_| TransportError::Closed)
        }

        fn local_addr(&self) -> IpAddr {
            "10.0.0.1".parse().unwrap()
        }
    }

    struct Harness {
        pipe: Arc<StreamPipe>,
        inbox: mpsc::Sender<Message>,
        sent: mpsc::UnboundedReceiver<Message>,
        cleaned: Arc<AtomicBool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn test_config() -> Arc<TunnelConfig> {
        Arc::new(TunnelConfig {
            round_timeout_ms: 100,
            idle_timeout_ms: 200,
            idle_reply_delay_ms: 20,
            ..TunnelConfig::default()
        })
    }

    fn start(role: Role) -> Harness {
        let (tx, sent) = mpsc::unbounded_channel();
        let (inbox, inbox_rx) = mpsc::channel(16);
        let pipe = Arc::new(StreamPipe::new());
        let cleaned = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&cleaned);
        let session = TunnelSession::new(
            role,
            SessionKey::new("10.0.0.2".parse().unwrap(), 5),
            Arc::clone(&pipe),
            Arc::new(ChannelSink { tx }),
            inbox_rx,
            test_config(),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );
        let task = session.spawn();

        Harness {
            pipe,
            inbox,
            sent,
            cleaned,
            task,
        }
    }

    async fn next_sent(h: &mut Harness) -> Message {
        tokio::time::timeout(Duration::from_secs(1), h.sent.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn echo(seq: u16, payload: &'static [u8]) -> Message {
        Message::echo(5, seq, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_initiator_sends_empty_echo_and_advances() {
        let mut h = start(Role::Initiator);

        let first = next_sent(&mut h).await;
        assert_eq!(first.kind, MessageKind::Echo);
        assert_eq!(first.seq, 1);
        assert!(first.payload.is_empty());

        h.inbox.send(first.reply(Bytes::from_static(b"hi"))).await.unwrap();
        let second = next_sent(&mut h).await;
        assert_eq!(second.seq, 2);

        let mut buf = [0u8; 2];
        assert_eq!(h.pipe.read(&mut buf).await, 2);
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_initiator_retransmits_same_payload() {
        let mut h = start(Role::Initiator);
        h.pipe.write(b"data").unwrap();

        let mut first = next_sent(&mut h).await;
        if first.payload.is_empty() {
            // Empty Echo raced the write; acknowledge it and take the next one
            h.inbox.send(first.reply(Bytes::new())).await.unwrap();
            first = next_sent(&mut h).await;
        }
        assert_eq!(&first.payload[..], b"data");

        // No reply: the same seq and payload come again after the timeout
        let retry = next_sent(&mut h).await;
        assert_eq!(retry.seq, first.seq);
        assert_eq!(retry.payload, first.payload);
    }

    #[tokio::test]
    async fn test_initiator_ignores_stale_reply() {
        let mut h = start(Role::Initiator);
        let first = next_sent(&mut h).await;

        let mut stale = first.reply(Bytes::from_static(b"old"));
        stale.seq = first.seq.wrapping_sub(1);
        h.inbox.send(stale).await.unwrap();

        // Still waiting on seq 1: the next packet is its retransmission
        let retry = next_sent(&mut h).await;
        assert_eq!(retry.seq, first.seq);
        assert_eq!(h.pipe.inbound_len(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_session_and_runs_cleanup() {
        let h = start(Role::Initiator);
        h.pipe.close().unwrap();

        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_responder_applies_duplicate_once() {
        let mut h = start(Role::Responder);

        for (seq, payload) in [(3u16, &b"a"[..]), (4, &b"b"[..]), (4, &b"b"[..])] {
            h.inbox.send(echo(seq, payload)).await.unwrap();
            let reply = next_sent(&mut h).await;
            assert_eq!(reply.kind, MessageKind::EchoReply);
            assert_eq!(reply.seq, seq);
        }

        let mut buf = [0u8; 8];
        let n = h.pipe.read(&mut buf).await;
        assert_eq!(&buf[..n], b"ab");
        assert_eq!(h.pipe.inbound_len(), 0);
    }

    #[tokio::test]
    async fn test_responder_piggybacks_and_resends_on_duplicate() {
        let mut h = start(Role::Responder);
        h.pipe.write(b"down").unwrap();

        h.inbox.send(echo(1, b"up")).await.unwrap();
        let reply = next_sent(&mut h).await;
        assert_eq!(&reply.payload[..], b"down");

        // Lost reply: the retransmitted Echo gets the same bytes again
        h.inbox.send(echo(1, b"up")).await.unwrap();
        let again = next_sent(&mut h).await;
        assert_eq!(&again.payload[..], b"down");

        // Out-of-window sequences get an empty reply
        h.inbox.send(echo(9, b"x")).await.unwrap();
        let stale = next_sent(&mut h).await;
        assert_eq!(stale.seq, 9);
        assert!(stale.payload.is_empty());
    }

    #[tokio::test]
    async fn test_responder_waits_for_data_on_idle_round() {
        let mut h = start(Role::Responder);

        h.inbox.send(echo(1, b"")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.pipe.write(b"late").unwrap();

        let reply = next_sent(&mut h).await;
        assert_eq!(&reply.payload[..], b"late");
    }

    #[tokio::test]
    async fn test_responder_paces_empty_duplicate() {
        let mut h = start(Role::Responder);

        h.inbox.send(echo(1, b"")).await.unwrap();
        assert!(next_sent(&mut h).await.payload.is_empty());

        let started = tokio::time::Instant::now();
        h.inbox.send(echo(1, b"")).await.unwrap();
        let again = next_sent(&mut h).await;

        assert_eq!(again.seq, 1);
        assert!(again.payload.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_responder_idle_timeout() {
        let h = start(Role::Responder);

        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.pipe.is_closed());
        assert!(h.cleaned.load(Ordering::SeqCst));
    }
}
