//! First-match routing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::crypto::NodeAddress;
use crate::reachability::ReachabilityHandler;

use super::{RoutingAlgorithm, RoutingError};

/// Sends every packet to the best-ranked peer whose map matches the
/// destination. Never hands a packet back to the peer it came from.
pub struct BasicAlgorithm {
    me: NodeAddress,
    reachability: Arc<ReachabilityHandler>,
}

impl BasicAlgorithm {
    pub fn new(me: NodeAddress, reachability: Arc<ReachabilityHandler>) -> Self {
        Self { me, reachability }
    }
}

#[async_trait]
impl RoutingAlgorithm for BasicAlgorithm {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn find_next_hop(
        &self,
        dest: &NodeAddress,
        src: &NodeAddress,
    ) -> Result<NodeAddress, RoutingError> {
        if *dest == self.me || self.reachability.is_peer(dest) {
            return Ok(*dest);
        }
        self.reachability
            .candidates(dest)
            .into_iter()
            .find(|peer| peer != src)
            .ok_or(RoutingError::NoRoute(*dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::BloomMap;
    use crate::crypto::sha512;

    fn addr(tag: &str) -> NodeAddress {
        NodeAddress::from_bytes(sha512(tag.as_bytes()))
    }

    fn reaching(entry: &str) -> BloomMap {
        let mut map = BloomMap::default();
        map.add_entry(&addr(entry));
        map.increment();
        map
    }

    #[test]
    fn picks_matching_peer_but_not_the_sender() {
        let reach = Arc::new(ReachabilityHandler::new(addr("me"), BloomMap::default()));
        let _a = reach.register_peer(addr("a"));
        let _b = reach.register_peer(addr("b"));
        reach.add_map(addr("a"), reaching("far"));

        let basic = BasicAlgorithm::new(addr("me"), reach.clone());
        assert_eq!(basic.find_next_hop(&addr("far"), &addr("me")).unwrap(), addr("a"));
        assert!(matches!(
            basic.find_next_hop(&addr("far"), &addr("a")),
            Err(RoutingError::NoRoute(_))
        ));
        assert_eq!(basic.find_next_hop(&addr("b"), &addr("a")).unwrap(), addr("b"));
    }
}
