//! Datagram forwarding between clients and their pinned targets.
//!
//! Each session gets one persistent upstream socket, connected to its target
//! so that only that target's datagrams are read back. A pump task relays
//! every reply to the client through the listener socket, unmodified.
//!
//! The upstream lives as long as the session: the target keeps seeing one
//! relay source address for the whole conversation. It is closed when the
//! session is evicted or drained, or by the pump itself once no datagram has
//! crossed it in either direction for the session idle timeout. The reply
//! timeout only bounds each wait for a reply.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn, Instrument};

use super::session::ClientEndpoint;
use crate::error::RelayError;
use crate::resolver::Target;

/// Default bound on a single wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Socket state shared between the forwarder and the pump.
struct UpstreamState {
    socket: UdpSocket,
    target: Target,
    opened_at: Instant,
    /// Milliseconds after `opened_at` of the latest datagram in either direction.
    last_activity_ms: AtomicU64,
}

impl UpstreamState {
    fn mark_activity(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.opened_at.elapsed().saturating_sub(last)
    }
}

/// A session's upstream channel. Dropping it stops the pump.
struct Upstream {
    state: Arc<UpstreamState>,
    pump: AbortHandle,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Debug, Default)]
struct ForwardCounters {
    forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    send_failures: AtomicU64,
    replies_relayed: AtomicU64,
    bytes_replied: AtomicU64,
    upstreams_opened: AtomicU64,
}

/// Forwarding statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Datagrams sent to targets.
    pub forwarded: u64,
    /// Payload bytes sent to targets.
    pub bytes_forwarded: u64,
    /// Sends (or upstream opens) that failed.
    pub send_failures: u64,
    /// Replies delivered to clients.
    pub replies_relayed: u64,
    /// Payload bytes delivered to clients.
    pub bytes_replied: u64,
    /// Upstream sockets opened since start.
    pub upstreams_opened: u64,
    /// Upstream sockets open now.
    pub upstreams_active: usize,
}

/// Forwarding engine shared by all packet handlers.
pub struct Forwarder {
    /// Listener socket; replies leave through it so clients see the relay address.
    downstream: Arc<UdpSocket>,
    upstreams: RwLock<HashMap<ClientEndpoint, Arc<Upstream>>>,
    /// Bound on one wait for a reply.
    reply_timeout: Duration,
    /// Quiet time after which an upstream closes itself. `None` keeps it until closed.
    idle_timeout: Option<Duration>,
    counters: ForwardCounters,
}

impl Forwarder {
    /// Create a forwarder replying through `downstream`.
    pub fn new(
        downstream: Arc<UdpSocket>,
        reply_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            upstreams: RwLock::new(HashMap::new()),
            reply_timeout,
            idle_timeout,
            counters: ForwardCounters::default(),
        })
    }

    /// Send `payload` to `target` and relay its replies to `reply_to`.
    ///
    /// A failed send is reported to the caller and counted; nothing is retried
    /// and the session is left alone.
    pub async fn forward(
        self: &Arc<Self>,
        payload: &[u8],
        target: Target,
        reply_to: ClientEndpoint,
    ) -> Result<usize, RelayError> {
        let send_error = |source: io::Error| RelayError::Send {
            target: target.socket_addr(),
            source,
        };

        let upstream = match self.upstream(target, reply_to).await {
            Ok(upstream) => upstream,
            Err(source) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                return Err(send_error(source));
            }
        };

        match upstream.state.socket.send(payload).await {
            Ok(sent) => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_forwarded
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(sent)
            }
            Err(source) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(send_error(source))
            }
        }
    }

    /// Close a client's upstream channel, if open.
    pub async fn close(&self, client: ClientEndpoint) -> bool {
        self.upstreams.write().await.remove(&client).is_some()
    }

    /// Close every upstream channel.
    pub async fn close_all(&self) -> usize {
        let mut upstreams = self.upstreams.write().await;
        let closed = upstreams.len();
        upstreams.clear();
        closed
    }

    /// Number of open upstream channels.
    pub async fn active_upstreams(&self) -> usize {
        self.upstreams.read().await.len()
    }

    /// Get forwarding statistics.
    pub async fn stats(&self) -> ForwardStats {
        ForwardStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.counters.bytes_forwarded.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            replies_relayed: self.counters.replies_relayed.load(Ordering::Relaxed),
            bytes_replied: self.counters.bytes_replied.load(Ordering::Relaxed),
            upstreams_opened: self.counters.upstreams_opened.load(Ordering::Relaxed),
            upstreams_active: self.active_upstreams().await,
        }
    }

    /// Existing upstream for the client, or a newly opened one.
    ///
    /// Activity is recorded while the map lock is held so a concurrent
    /// `retire` cannot close the channel between lookup and send.
    async fn upstream(
        self: &Arc<Self>,
        target: Target,
        client: ClientEndpoint,
    ) -> io::Result<Arc<Upstream>> {
        // Fast path: read lock
        {
            let upstreams = self.upstreams.read().await;
            if let Some(upstream) = upstreams.get(&client) {
                if upstream.state.target == target {
                    upstream.state.mark_activity();
                    return Ok(Arc::clone(upstream));
                }
            }
        }

        // Socket setup happens without the lock held.
        let opened = Arc::new(self.open(target, client).await?);

        // Slow path: write lock, re-check
        let mut upstreams = self.upstreams.write().await;
        if let Some(existing) = upstreams.get(&client) {
            if existing.state.target == target {
                // Lost the race; `opened` is dropped and its pump stopped.
                existing.state.mark_activity();
                return Ok(Arc::clone(existing));
            }
        }

        opened.state.mark_activity();
        // Replaces (and stops) a channel to a stale target.
        upstreams.insert(client, Arc::clone(&opened));
        self.counters.upstreams_opened.fetch_add(1, Ordering::Relaxed);

        Ok(opened)
    }

    async fn open(self: &Arc<Self>, target: Target, client: ClientEndpoint) -> io::Result<Upstream> {
        let local: SocketAddr = if target.host.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(target.socket_addr()).await?;

        debug!(
            client = %client,
            target = %target,
            local_addr = %socket.local_addr()?,
            "Opened upstream channel"
        );

        let state = Arc::new(UpstreamState {
            socket,
            target,
            opened_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        });

        let pump = tokio::spawn(
            run_pump(Arc::downgrade(self), Arc::clone(&state), client)
                .instrument(tracing::debug_span!("upstream", client = %client, target = %target)),
        );

        Ok(Upstream {
            state,
            pump: pump.abort_handle(),
        })
    }

    /// Remove the client's upstream if it is still `state` and still idle.
    ///
    /// Returns true when the pump should stop.
    async fn retire(
        &self,
        client: ClientEndpoint,
        state: &Arc<UpstreamState>,
        idle_timeout: Duration,
    ) -> bool {
        let mut upstreams = self.upstreams.write().await;
        let Some(current) = upstreams.get(&client) else {
            return true;
        };
        if !Arc::ptr_eq(&current.state, state) {
            return true;
        }
        if state.idle_for() < idle_timeout {
            return false;
        }
        upstreams.remove(&client);
        true
    }

    async fn relay_reply(&self, reply: &[u8], client: ClientEndpoint) {
        match self.downstream.send_to(reply, client.socket_addr()).await {
            Ok(sent) => {
                self.counters.replies_relayed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_replied
                    .fetch_add(sent as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(client = %client, error = %e, "Failed to relay reply to client");
            }
        }
    }
}

/// Relay replies from the target until the channel is closed or goes idle.
async fn run_pump(forwarder: Weak<Forwarder>, state: Arc<UpstreamState>, client: ClientEndpoint) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let Some(reply_timeout) = forwarder.upgrade().map(|f| f.reply_timeout) else {
            return;
        };

        match timeout(reply_timeout, state.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                state.mark_activity();
                let Some(forwarder) = forwarder.upgrade() else {
                    return;
                };
                forwarder.relay_reply(&buf[..n], client).await;
            }
            Ok(Err(e)) => {
                // ICMP errors surface here on connected sockets.
                debug!(error = %e, "Upstream receive error");
            }
            Err(_) => {
                let Some(forwarder) = forwarder.upgrade() else {
                    return;
                };
                let Some(idle_timeout) = forwarder.idle_timeout else {
                    continue;
                };
                if state.idle_for() >= idle_timeout
                    && forwarder.retire(client, &state, idle_timeout).await
                {
                    debug!(
                        open_for_ms = state.opened_at.elapsed().as_millis() as u64,
                        "Closed idle upstream channel"
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Peers = Arc<Mutex<Vec<SocketAddr>>>;

    /// Echo server recording the source of every datagram.
    async fn udp_echo() -> (SocketAddr, Peers) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let peers: Peers = Arc::default();
        let seen = Arc::clone(&peers);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                seen.lock().unwrap().push(peer);
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        (addr, peers)
    }

    async fn setup(
        reply_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> (Arc<Forwarder>, UdpSocket, ClientEndpoint) {
        let downstream = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ClientEndpoint::new(client.local_addr().unwrap());
        (
            Forwarder::new(downstream, reply_timeout, idle_timeout),
            client,
            endpoint,
        )
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .expect("reply timed out")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_forward_and_relay_reply() {
        let (echo_addr, _) = udp_echo().await;
        let (forwarder, client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        let sent = forwarder
            .forward(b"ping", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        assert_eq!(sent, 4);
        assert_eq!(recv(&client).await, b"ping");

        let stats = forwarder.stats().await;
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.replies_relayed, 1);
    }

    #[tokio::test]
    async fn test_upstream_reused_per_session() {
        let (echo_addr, _) = udp_echo().await;
        let (forwarder, client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        for payload in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
            forwarder
                .forward(payload, Target::from(echo_addr), endpoint)
                .await
                .unwrap();
            assert_eq!(recv(&client).await, payload);
        }

        let stats = forwarder.stats().await;
        assert_eq!(stats.upstreams_opened, 1);
        assert_eq!(stats.upstreams_active, 1);
    }

    #[tokio::test]
    async fn test_source_address_stable_across_pause_longer_than_reply_timeout() {
        let (echo_addr, peers) = udp_echo().await;
        let (forwarder, client, endpoint) =
            setup(Duration::from_millis(100), Some(Duration::from_secs(30))).await;

        forwarder
            .forward(b"first", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        assert_eq!(recv(&client).await, b"first");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(forwarder.active_upstreams().await, 1);

        forwarder
            .forward(b"again", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        assert_eq!(recv(&client).await, b"again");

        let peers = peers.lock().unwrap().clone();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], peers[1]);
        assert_eq!(forwarder.stats().await.upstreams_opened, 1);
    }

    #[tokio::test]
    async fn test_upstream_closed_after_idle_timeout() {
        let (echo_addr, _) = udp_echo().await;
        let (forwarder, client, endpoint) =
            setup(Duration::from_millis(50), Some(Duration::from_millis(200))).await;

        forwarder
            .forward(b"ping", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        recv(&client).await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(forwarder.active_upstreams().await, 0);

        // A later forward reopens the channel.
        forwarder
            .forward(b"again", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        assert_eq!(recv(&client).await, b"again");
        assert_eq!(forwarder.stats().await.upstreams_opened, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_forwards_share_one_upstream() {
        let (echo_addr, peers) = udp_echo().await;
        let (forwarder, client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let forwarder = Arc::clone(&forwarder);
            handles.push(tokio::spawn(async move {
                forwarder
                    .forward(&[i], Target::from(echo_addr), endpoint)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        for _ in 0..8 {
            recv(&client).await;
        }

        let stats = forwarder.stats().await;
        assert_eq!(stats.upstreams_opened, 1);
        assert_eq!(stats.upstreams_active, 1);
        let peers = peers.lock().unwrap().clone();
        assert_eq!(peers.len(), 8);
        assert!(peers.iter().all(|peer| *peer == peers[0]));
    }

    #[tokio::test]
    async fn test_steady_traffic_keeps_upstream_open() {
        let (echo_addr, peers) = udp_echo().await;
        let (forwarder, client, endpoint) =
            setup(Duration::from_millis(20), Some(Duration::from_millis(300))).await;

        for i in 0..10u8 {
            forwarder
                .forward(&[i], Target::from(echo_addr), endpoint)
                .await
                .unwrap();
            recv(&client).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
        }

        assert_eq!(forwarder.stats().await.upstreams_opened, 1);
        let peers = peers.lock().unwrap().clone();
        assert!(peers.iter().all(|peer| *peer == peers[0]));
    }

    #[tokio::test]
    async fn test_close_reopens_on_next_forward() {
        let (echo_addr, peers) = udp_echo().await;
        let (forwarder, client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        forwarder
            .forward(b"one", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        recv(&client).await;

        assert!(forwarder.close(endpoint).await);
        assert_eq!(forwarder.active_upstreams().await, 0);

        forwarder
            .forward(b"two", Target::from(echo_addr), endpoint)
            .await
            .unwrap();
        assert_eq!(recv(&client).await, b"two");
        assert_eq!(forwarder.stats().await.upstreams_opened, 2);
        assert_eq!(peers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_reported_and_counted() {
        let (echo_addr, peers) = udp_echo().await;
        let (forwarder, _client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        // Larger than any IPv4 UDP payload: the send itself fails.
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE];
        match forwarder
            .forward(&oversized, Target::from(echo_addr), endpoint)
            .await
        {
            Err(RelayError::Send { target, .. }) => assert_eq!(target, echo_addr),
            other => panic!("Expected send error, got {:?}", other),
        }

        let stats = forwarder.stats().await;
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.forwarded, 0);
        assert!(peers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let (echo_addr, _) = udp_echo().await;
        let (forwarder, _client, endpoint) = setup(DEFAULT_REPLY_TIMEOUT, None).await;

        forwarder
            .forward(b"ping", Target::from(echo_addr), endpoint)
            .await
            .unwrap();

        assert_eq!(forwarder.close_all().await, 1);
        assert_eq!(forwarder.active_upstreams().await, 0);
        assert!(!forwarder.close(endpoint).await);
    }
}
