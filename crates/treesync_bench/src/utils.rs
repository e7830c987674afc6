//! Data generators shared by the benchmarks.

use rand::Rng;
use treesync_core::{ChildKey, Node, Path};

/// Generate a key drawn from `width` possible names.
pub fn random_key(rng: &mut impl Rng, width: usize) -> ChildKey {
    ChildKey::new(&format!("k{}", rng.gen_range(0..width.max(1))))
}

/// Generate a path of exactly `depth` keys.
pub fn random_path(rng: &mut impl Rng, depth: usize, width: usize) -> Path {
    Path::from_keys((0..depth).map(|_| random_key(rng, width)).collect())
}

/// Generate a full tree `depth` levels deep with `width` children per level.
pub fn wide_tree(depth: usize, width: usize) -> Node {
    if depth == 0 {
        return Node::from("leaf");
    }
    Node::from_children((0..width).map(|i| (ChildKey::new(&format!("k{i}")), wide_tree(depth - 1, width))))
}

/// Generate a list of `count` numbered children, as a chat room or feed
/// would hold.
pub fn numbered_children(count: usize) -> Node {
    Node::from_children((0..count).map(|i| (ChildKey::new(&format!("item{i:06}")), Node::from(i as i64))))
}

/// Generate `count` random leaf writes at paths `depth` keys deep.
pub fn random_writes(count: usize, depth: usize, width: usize) -> Vec<(Path, Node)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let path = random_path(&mut rng, depth, width);
            let value: i64 = rng.gen_range(0..1_000);
            (path, Node::from(value))
        })
        .collect()
}
