use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Root of the integrity tree over the ordered event hashes. Odd nodes are
/// paired with themselves, so every layer halves (rounded up).
pub fn compute_merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return empty_root();
    }

    let mut layer: Vec<String> = hashes.to_vec();

    while layer.len() > 1 {
        let mut next = Vec::new();
        for chunk in layer.chunks(2) {
            let combined = if chunk.len() == 1 {
                format!("{}{}", chunk[0], chunk[0])
            } else {
                format!("{}{}", chunk[0], chunk[1])
            };
            let digest = Sha256::digest(combined.as_bytes());
            next.push(hex::encode(digest));
        }
        layer = next;
    }

    layer.first().cloned().unwrap_or_else(empty_root)
}

pub fn empty_root() -> String {
    static EMPTY: OnceLock<String> = OnceLock::new();
    EMPTY
        .get_or_init(|| hex::encode(Sha256::digest(&[])))
        .clone()
}

/// One step of a membership proof: the sibling hash and which side of the
/// pair it sits on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofNode {
    pub hash: String,
    pub right: bool,
}

/// Sibling path from one leaf to the root. Lets a replica prove an event's
/// membership in the log without transferring the whole log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf: String,
    pub path: Vec<ProofNode>,
}

pub fn membership_proof(hashes: &[String], index: usize) -> Option<MerkleProof> {
    if index >= hashes.len() {
        return None;
    }

    let leaf = hashes[index].clone();
    let mut path = Vec::new();
    let mut layer: Vec<String> = hashes.to_vec();
    let mut position = index;

    while layer.len() > 1 {
        let sibling = if position % 2 == 0 {
            // Right sibling, or the node itself when the layer ends here.
            let hash = layer.get(position + 1).unwrap_or(&layer[position]).clone();
            ProofNode { hash, right: true }
        } else {
            ProofNode {
                hash: layer[position - 1].clone(),
                right: false,
            }
        };
        path.push(sibling);

        let mut next = Vec::new();
        for chunk in layer.chunks(2) {
            let combined = if chunk.len() == 1 {
                format!("{}{}", chunk[0], chunk[0])
            } else {
                format!("{}{}", chunk[0], chunk[1])
            };
            next.push(hex::encode(Sha256::digest(combined.as_bytes())));
        }
        layer = next;
        position /= 2;
    }

    Some(MerkleProof { leaf, path })
}

pub fn verify_membership(root: &str, proof: &MerkleProof) -> bool {
    let mut current = proof.leaf.clone();
    for node in &proof.path {
        let combined = if node.right {
            format!("{}{}", current, node.hash)
        } else {
            format!("{}{}", node.hash, current)
        };
        current = hex::encode(Sha256::digest(combined.as_bytes()));
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: &str) -> String {
        hex::encode(Sha256::digest(tag.as_bytes()))
    }

    #[test]
    fn empty_log_has_stable_root() {
        assert_eq!(compute_merkle_root(&[]), empty_root());
    }

    #[test]
    fn root_is_deterministic() {
        let hashes = vec![leaf("a"), leaf("b"), leaf("c")];
        assert_eq!(compute_merkle_root(&hashes), compute_merkle_root(&hashes));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for total in 1..=9usize {
            let hashes: Vec<String> = (0..total).map(|i| leaf(&format!("evt-{i}"))).collect();
            let root = compute_merkle_root(&hashes);
            for index in 0..total {
                let proof = membership_proof(&hashes, index).unwrap();
                assert!(
                    verify_membership(&root, &proof),
                    "leaf {index} of {total} failed"
                );
            }
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let hashes = vec![leaf("a"), leaf("b"), leaf("c"), leaf("d")];
        let root = compute_merkle_root(&hashes);
        let mut proof = membership_proof(&hashes, 2).unwrap();
        proof.leaf = leaf("forged");
        assert!(!verify_membership(&root, &proof));
    }

    #[test]
    fn proof_out_of_range_is_none() {
        let hashes = vec![leaf("a")];
        assert!(membership_proof(&hashes, 1).is_none());
    }
}
