//! # Merkle Delivery Receipts
//!
//! A destination does not acknowledge packets one by one. It buffers the
//! hashes of what it received, builds a binary Merkle tree over them, and
//! signs the root once. One signature then vouches for every leaf.
//!
//! ## Tree shape
//!
//! Leaves are paired left to right, level by level. A lone node at the
//! end of an odd level is carried up with no right sibling:
//!
//! ```text
//! leaf(h)          = SHA512(h)
//! branch(l, r)     = SHA512(l.hash() ‖ r.hash())
//! branch(l, none)  = SHA512(l.hash())
//! ```
//!
//! The root hash is the signed message, so `sig.message == root.hash()` is
//! the first thing [`PacketReceipt::verify`] checks.

use serde::{Deserialize, Serialize};

use crate::crypto::signatures::SignatureError;
use crate::crypto::{sha512, sha512_multi, NodeAddress, PacketHash, PrivateKey, Signature};

/// A node in a receipt tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MerkleNode {
    Leaf(PacketHash),
    Branch {
        left: Box<MerkleNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        right: Option<Box<MerkleNode>>,
    },
}

impl MerkleNode {
    /// Build a tree over `hashes`. `None` for an empty list.
    pub fn build(hashes: &[PacketHash]) -> Option<Self> {
        let mut level: Vec<MerkleNode> = hashes.iter().copied().map(MerkleNode::Leaf).collect();
        if level.is_empty() {
            return None;
        }

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut nodes = level.into_iter();
            while let Some(left) = nodes.next() {
                next.push(MerkleNode::Branch {
                    left: Box::new(left),
                    right: nodes.next().map(Box::new),
                });
            }
            level = next;
        }
        level.pop()
    }

    pub fn hash(&self) -> [u8; 64] {
        match self {
            MerkleNode::Leaf(h) => sha512(h.as_bytes()),
            MerkleNode::Branch { left, right: None } => sha512(&left.hash()),
            MerkleNode::Branch {
                left,
                right: Some(right),
            } => sha512_multi(&[&left.hash(), &right.hash()]),
        }
    }

    /// Leaves in left-to-right order.
    pub fn leaves(&self) -> Vec<PacketHash> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<PacketHash>) {
        match self {
            MerkleNode::Leaf(h) => out.push(*h),
            MerkleNode::Branch { left, right } => {
                left.collect_leaves(out);
                if let Some(right) = right {
                    right.collect_leaves(out);
                }
            }
        }
    }
}

/// A signed bundle of delivered packet hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketReceipt {
    pub tree: MerkleNode,
    pub sig: Signature,
}

impl PacketReceipt {
    /// Root hash must equal the signed message, and the signature must hold.
    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.sig.message != self.tree.hash() {
            return Err(SignatureError::Invalid);
        }
        self.sig.verify()
    }

    /// Address of whoever signed the receipt, i.e. the destination that
    /// received the packets.
    pub fn source(&self) -> Option<NodeAddress> {
        self.sig.signer()
    }

    pub fn list_packets(&self) -> Vec<PacketHash> {
        self.tree.leaves()
    }
}

/// Build and sign a receipt over `hashes`. `None` when there is nothing to
/// acknowledge.
pub fn make_receipt(key: &PrivateKey, hashes: &[PacketHash]) -> Option<PacketReceipt> {
    let tree = MerkleNode::build(hashes)?;
    let sig = key.sign(&tree.hash());
    Some(PacketReceipt { tree, sig })
}
