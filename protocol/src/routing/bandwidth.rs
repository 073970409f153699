//! Bandwidth-weighted random routing.
//!
//! Every packet frame a link writes yields a throughput sample
//! `bytes / (written − queued)`, taken by the connection's writer (see
//! [`WriteSample`](crate::transport::WriteSample)). Samples feed a per-peer exponentially weighted moving
//! average:
//!
//! ```text
//! b ← α·sample + (1 − α)·b        (first sample: b ← sample)
//! ```
//!
//! Next-hop choice is a weighted draw over the peers whose maps match the
//! destination, skipping peers whose maps also match the packet's previous
//! hop so packets do not bounce straight back. Unsampled peers get weight
//! `1/n`; sampled peers split the remaining mass in proportion to their
//! estimates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::crypto::NodeAddress;
use crate::reachability::ReachabilityHandler;
use crate::transport::Connection;

use super::{RoutingAlgorithm, RoutingError};

#[derive(Debug, Default, Clone, Copy)]
struct PeerEstimate {
    bandwidth: Option<f64>,
    samples: u64,
}

/// Estimates shared with the per-link sampling tasks.
struct Estimates {
    alpha: f64,
    peers: Mutex<HashMap<NodeAddress, PeerEstimate>>,
}

impl Estimates {
    fn record(&self, peer: NodeAddress, sample: f64) {
        if !sample.is_finite() || sample < 0.0 {
            return;
        }
        let mut peers = self.peers.lock();
        let entry = peers.entry(peer).or_default();
        entry.bandwidth = Some(match entry.bandwidth {
            Some(b) => self.alpha * sample + (1.0 - self.alpha) * b,
            None => sample,
        });
        entry.samples += 1;
    }
}

pub struct BandwidthAlgorithm {
    me: NodeAddress,
    reachability: Arc<ReachabilityHandler>,
    estimates: Arc<Estimates>,
    rng: Mutex<StdRng>,
}

impl BandwidthAlgorithm {
    /// `alpha` is clamped into `(0, 1]`. A `seed` makes the draws
    /// reproducible.
    pub fn new(
        me: NodeAddress,
        reachability: Arc<ReachabilityHandler>,
        alpha: f64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        Self {
            me,
            reachability,
            estimates: Arc::new(Estimates {
                alpha,
                peers: Mutex::new(HashMap::new()),
            }),
            rng: Mutex::new(rng),
        }
    }

    /// Current estimate for `peer` in bytes per second.
    pub fn bandwidth(&self, peer: &NodeAddress) -> Option<f64> {
        self.estimates.peers.lock().get(peer).and_then(|e| e.bandwidth)
    }

    /// Number of samples folded into `peer`'s estimate.
    pub fn sample_count(&self, peer: &NodeAddress) -> u64 {
        self.estimates.peers.lock().get(peer).map_or(0, |e| e.samples)
    }

    /// Fold one throughput sample into `peer`'s estimate.
    pub fn record_sample(&self, peer: NodeAddress, sample: f64) {
        self.estimates.record(peer, sample);
    }

    /// Selection weights for `candidates`, summing to 1.
    pub fn weights(&self, candidates: &[NodeAddress]) -> Vec<f64> {
        let peers = self.estimates.peers.lock();
        let known: Vec<Option<f64>> = candidates
            .iter()
            .map(|p| {
                peers
                    .get(p)
                    .and_then(|e| e.bandwidth)
                    .filter(|b| *b > 0.0)
            })
            .collect();
        drop(peers);
        share_weights(&known)
    }
}

/// Unsampled entries get `1/n`. Sampled entries split `n_sampled/n` in
/// proportion to their values.
fn share_weights(known: &[Option<f64>]) -> Vec<f64> {
    let n = known.len() as f64;
    let sampled = known.iter().filter(|b| b.is_some()).count() as f64;
    let total: f64 = known.iter().flatten().sum();
    known
        .iter()
        .map(|b| match b {
            Some(b) if total > 0.0 => (sampled / n) * (b / total),
            _ => 1.0 / n,
        })
        .collect()
}

/// Index of the first cumulative weight exceeding `u`. Falls back to the
/// last index when rounding leaves the total just under `u`.
pub fn weighted_choice(weights: &[f64], u: f64) -> Option<usize> {
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if cumulative > u {
            return Some(i);
        }
    }
    weights.len().checked_sub(1)
}

#[async_trait]
impl RoutingAlgorithm for BandwidthAlgorithm {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn find_next_hop(
        &self,
        dest: &NodeAddress,
        src: &NodeAddress,
    ) -> Result<NodeAddress, RoutingError> {
        if *dest == self.me || self.reachability.is_peer(dest) {
            return Ok(*dest);
        }

        let mut candidates: Vec<NodeAddress> = self
            .reachability
            .candidates(dest)
            .into_iter()
            .filter(|p| p != src)
            .collect();
        if *src != self.me {
            let away: Vec<NodeAddress> = candidates
                .iter()
                .copied()
                .filter(|p| !self.reachability.peer_reaches(p, src))
                .collect();
            // In a well-meshed network every peer eventually reaches the
            // previous hop; keep the unfiltered set rather than drop.
            if !away.is_empty() {
                candidates = away;
            }
        }

        let weights = self.weights(&candidates);
        let u: f64 = self.rng.lock().gen();
        let choice = weighted_choice(&weights, u)
            .map(|i| candidates[i])
            .ok_or(RoutingError::NoRoute(*dest))?;
        trace!(dest = %dest, next = %choice, candidates = candidates.len(), "weighted choice");
        Ok(choice)
    }

    fn add_connection(&self, conn: &Arc<Connection>) {
        let peer = conn.peer();
        let Some(mut samples) = conn.take_write_samples() else {
            debug!(peer = %peer, "write samples already taken");
            return;
        };
        let estimates = Arc::clone(&self.estimates);
        tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                estimates.record(peer, sample.bytes_per_sec());
            }
        });
    }

    fn remove_peer(&self, peer: &NodeAddress) {
        self.estimates.peers.lock().remove(peer);
    }

    fn cleanup(&self) {
        self.estimates.peers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::*;
    use crate::bloom::BloomMap;
    use crate::crypto::{sha512, PrivateKey, Role};
    use crate::packet::Packet;
    use crate::transport::LocalIdentity;

    fn addr(tag: &str) -> NodeAddress {
        NodeAddress::from_bytes(sha512(tag.as_bytes()))
    }

    fn reaching(entries: &[&str]) -> BloomMap {
        let mut map = BloomMap::default();
        for e in entries {
            map.add_entry(&addr(e));
        }
        map.increment();
        map
    }

    #[test]
    fn fixed_draws_pick_b_a_c() {
        let weights = [0.2, 0.3, 0.4, 0.1];
        let names = ["A", "B", "C", "D"];
        let picks: Vec<&str> = [0.25, 0.1, 0.6]
            .into_iter()
            .map(|u| names[weighted_choice(&weights, u).unwrap()])
            .collect();
        assert_eq!(picks, ["B", "A", "C"]);
    }

    #[test]
    fn choice_falls_back_to_last_on_drift() {
        assert_eq!(weighted_choice(&[0.3, 0.3, 0.3], 0.95), Some(2));
        assert_eq!(weighted_choice(&[], 0.5), None);
    }

    #[test]
    fn unsampled_candidates_share_evenly() {
        assert_eq!(share_weights(&[None, None, None, None]), vec![0.25; 4]);

        let w = share_weights(&[Some(300.0), Some(100.0), None, None]);
        assert!((w[0] - 0.375).abs() < 1e-12);
        assert!((w[1] - 0.125).abs() < 1e-12);
        assert_eq!(w[2], 0.25);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn estimate_is_an_ewma() {
        let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
        let algo = BandwidthAlgorithm::new(addr("me"), reach, 0.5, Some(1));
        algo.record_sample(addr("a"), 100.0);
        assert_eq!(algo.bandwidth(&addr("a")), Some(100.0));
        algo.record_sample(addr("a"), 200.0);
        assert_eq!(algo.bandwidth(&addr("a")), Some(150.0));
        algo.record_sample(addr("a"), f64::NAN);
        assert_eq!(algo.bandwidth(&addr("a")), Some(150.0));

        algo.remove_peer(&addr("a"));
        assert_eq!(algo.bandwidth(&addr("a")), None);
    }

    #[test]
    fn candidates_avoid_the_previous_hop() {
        let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
        let _a = reach.register_peer(addr("a"));
        let _b = reach.register_peer(addr("b"));
        let _c = reach.register_peer(addr("c"));
        reach.add_map(addr("b"), reaching(&["far", "a"]));
        reach.add_map(addr("c"), reaching(&["far"]));

        let algo = BandwidthAlgorithm::new(addr("me"), reach, 0.2, Some(7));
        for _ in 0..20 {
            assert_eq!(algo.find_next_hop(&addr("far"), &addr("a")).unwrap(), addr("c"));
        }
    }

    #[test]
    fn no_candidates_is_no_route() {
        let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
        let algo = BandwidthAlgorithm::new(addr("me"), reach, 0.2, Some(7));
        assert!(matches!(
            algo.find_next_hop(&addr("far"), &addr("me")),
            Err(RoutingError::NoRoute(dest)) if dest == addr("far")
        ));
        assert_eq!(algo.find_next_hop(&addr("me"), &addr("x")).unwrap(), addr("me"));
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let pick = |seed| {
            let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
            for p in ["a", "b", "c"] {
                let _ = reach.register_peer(addr(p));
                reach.add_map(addr(p), reaching(&["far"]));
            }
            let algo = BandwidthAlgorithm::new(addr("me"), reach, 0.2, Some(seed));
            (0..8)
                .map(|_| algo.find_next_hop(&addr("far"), &addr("me")).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(pick(42), pick(42));
    }

    #[test]
    fn seeded_choices_follow_the_share_weights() {
        let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
        for p in ["a", "b", "c", "d"] {
            let _ = reach.register_peer(addr(p));
            reach.add_map(addr(p), reaching(&["far"]));
        }
        let algo = BandwidthAlgorithm::new(addr("me"), reach, 0.2, Some(2024));
        algo.record_sample(addr("a"), 300.0);
        algo.record_sample(addr("b"), 100.0);

        const DRAWS: usize = 4000;
        let mut counts: HashMap<NodeAddress, usize> = HashMap::new();
        for _ in 0..DRAWS {
            let hop = algo.find_next_hop(&addr("far"), &addr("me")).unwrap();
            *counts.entry(hop).or_default() += 1;
        }

        assert_eq!(counts.values().sum::<usize>(), DRAWS);
        for (peer, expected) in [("a", 0.375), ("b", 0.125), ("c", 0.25), ("d", 0.25)] {
            let share = counts.get(&addr(peer)).copied().unwrap_or(0) as f64 / DRAWS as f64;
            assert!(
                (share - expected).abs() < 0.03,
                "{peer} picked {share:.3} of the time, expected {expected}"
            );
        }
    }

    /// Holds every write back by `delay` before passing it on.
    struct Throttled<T> {
        inner: T,
        delay: Duration,
        pending: Option<Pin<Box<tokio::time::Sleep>>>,
    }

    impl<T: AsyncRead + Unpin> AsyncRead for Throttled<T> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for Throttled<T> {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let delay = this.delay;
            let sleep = this
                .pending
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            ready!(sleep.as_mut().poll(cx));
            this.pending = None;
            Pin::new(&mut this.inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    fn identity(key: &Arc<PrivateKey>) -> LocalIdentity {
        LocalIdentity {
            key: key.clone(),
            payment_address: "pay".into(),
        }
    }

    /// A link from `me` to a fresh peer. Our side's writes are held back by
    /// `delay` when one is given.
    async fn link(
        me: &Arc<PrivateKey>,
        delay: Option<Duration>,
    ) -> (Arc<Connection>, Arc<Connection>) {
        let peer = Arc::new(PrivateKey::generate());
        let (x, y) = tokio::io::duplex(256 * 1024);
        let my_identity = identity(me);
        let peer_identity = identity(&peer);
        let (ours, theirs) = match delay {
            Some(delay) => {
                let slow = Throttled {
                    inner: x,
                    delay,
                    pending: None,
                };
                tokio::join!(
                    Connection::establish(slow, Role::Dialer, &my_identity),
                    Connection::establish(y, Role::Listener, &peer_identity)
                )
            }
            None => tokio::join!(
                Connection::establish(x, Role::Dialer, &my_identity),
                Connection::establish(y, Role::Listener, &peer_identity)
            ),
        };
        (ours.unwrap(), theirs.unwrap())
    }

    #[tokio::test]
    async fn slow_link_gets_a_lower_estimate_and_fewer_packets() {
        let me = Arc::new(PrivateKey::generate());
        let (fast, _fast_remote) = link(&me, None).await;
        let (slow, _slow_remote) = link(&me, Some(Duration::from_millis(20))).await;

        let reach = Arc::new(ReachabilityHandler::new(me.address(), BloomMap::default()));
        for conn in [&fast, &slow] {
            let _ = reach.register_peer(conn.peer());
            reach.add_map(conn.peer(), reaching(&["far"]));
        }
        let algo = BandwidthAlgorithm::new(me.address(), reach, 0.5, Some(11));
        algo.add_connection(&fast);
        algo.add_connection(&slow);

        const SENDS: u64 = 8;
        let packet = Packet::new(addr("far"), 1, vec![0x5a; 1024]);
        for _ in 0..SENDS {
            algo.send_packet(&fast, &packet).await.unwrap();
            algo.send_packet(&slow, &packet).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(10), async {
            while algo.sample_count(&fast.peer()) < SENDS || algo.sample_count(&slow.peer()) < SENDS {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let fast_bw = algo.bandwidth(&fast.peer()).unwrap();
        let slow_bw = algo.bandwidth(&slow.peer()).unwrap();
        assert!(slow_bw < fast_bw, "slow {slow_bw} vs fast {fast_bw}");

        let weights = algo.weights(&[fast.peer(), slow.peer()]);
        assert!(weights[1] < weights[0]);

        let mut slow_picks = 0;
        for _ in 0..1000 {
            if algo.find_next_hop(&addr("far"), &me.address()).unwrap() == slow.peer() {
                slow_picks += 1;
            }
        }
        assert!(slow_picks < 500, "slow link picked {slow_picks} of 1000");
    }
}
