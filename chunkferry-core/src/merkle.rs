/// Binary Merkle root over BLAKE3 leaf hashes.
///
/// Interior nodes hash `0x01 || left || right`; an unpaired node at the end of
/// a layer is promoted unchanged. An empty leaf set hashes to `blake3("")`.
pub fn root(leaves: &[blake3::Hash]) -> blake3::Hash {
    if leaves.is_empty() {
        return blake3::hash(&[]);
    }
    let mut layer: Vec<blake3::Hash> = leaves.to_vec();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [l, r] => {
                    let mut h = blake3::Hasher::new();
                    h.update(&[0x01]);
                    h.update(l.as_bytes());
                    h.update(r.as_bytes());
                    h.finalize()
                }
                [one] => *one,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    layer[0]
}

/// Leaf hash of one segment, domain-separated from interior nodes.
pub fn leaf(segment: &[u8]) -> blake3::Hash {
    let mut h = blake3::Hasher::new();
    h.update(&[0x00]);
    h.update(segment);
    h.finalize()
}
