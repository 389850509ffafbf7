use std::fmt;

use hashbrown::HashSet;

use crate::net::{
    error::{Error, Result},
    wire::WireNode,
};

/// A logical node name together with its default send address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub name: String,
    pub addr: String,
}

impl NodeAddr {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// An arena slot. The subtree rooted here occupies this slot and the
/// `span - 1` slots right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub node: NodeAddr,
    pub span: usize,
}

/// A forward tree stored as a preorder arena.
///
/// The top level is a forest: its roots are the direct branch targets of
/// whoever holds the tree. Children of the root at index `i` start at `i + 1`
/// and the next sibling starts at `i + span`. Because the split is always
/// into contiguous chunks, the preorder order is just the input order and no
/// node is ever moved.
#[derive(Debug, Clone)]
pub struct ForwardTree {
    nodes: Vec<TreeNode>,
    depth: usize,
}

impl ForwardTree {
    /// Splits `targets` into at most `fanout` contiguous branches whose sizes
    /// differ by at most one. The head of each branch is contacted directly
    /// and relays to the rest of its branch, split the same way.
    pub fn build(targets: Vec<NodeAddr>, fanout: usize) -> Result<Self> {
        if fanout == 0 {
            return Err(Error::InvalidFanout);
        }
        if targets.is_empty() {
            return Err(Error::EmptyDispatch);
        }
        check_unique(targets.iter().map(|n| n.name.as_str()))?;

        let mut nodes = targets
            .into_iter()
            .map(|node| TreeNode { node, span: 1 })
            .collect::<Vec<_>>();
        let depth = layout(&mut nodes, fanout);
        Ok(Self { nodes, depth })
    }

    /// Rebuilds the tree a parent delegated to us. The shape is taken as
    /// sent; it only has to tile the list exactly.
    pub fn from_descriptor(descriptor: Vec<WireNode>) -> Result<Self> {
        if descriptor.is_empty() {
            return Err(Error::EmptyDispatch);
        }
        check_unique(descriptor.iter().map(|n| n.name.as_str()))?;

        let nodes = descriptor
            .into_iter()
            .map(|n| TreeNode {
                node: NodeAddr::new(n.name, n.addr),
                span: n.span as usize,
            })
            .collect::<Vec<_>>();
        let depth = measure(&nodes).ok_or(Error::MalformedDescriptor)?;
        Ok(Self { nodes, depth })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of hops from the holder of the tree to its deepest node.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn branches(&self) -> Branches<'_> {
        Branches {
            nodes: &self.nodes,
            next: 0,
        }
    }

    /// The branch whose head sits at `start`. `start` must be a top-level
    /// index, as yielded by `branches()`.
    pub fn branch(&self, start: usize) -> Branch<'_> {
        let span = self.nodes[start].span;
        Branch {
            start,
            nodes: &self.nodes[start..start + span],
        }
    }
}

/// One first-level target and everything it relays to.
#[derive(Debug, Clone, Copy)]
pub struct Branch<'a> {
    start: usize,
    nodes: &'a [TreeNode],
}

impl<'a> Branch<'a> {
    /// Arena index of the head.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn head(&self) -> &'a NodeAddr {
        &self.nodes[0].node
    }

    /// The head followed by its whole subtree.
    pub fn nodes(&self) -> &'a [TreeNode] {
        self.nodes
    }

    /// The part of the branch the head has to forward to.
    pub fn subtree(&self) -> &'a [TreeNode] {
        &self.nodes[1..]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn names(&self) -> impl Iterator<Item = &'a str> {
        self.nodes.iter().map(|n| n.node.name.as_str())
    }

    /// The subtree as it goes on the wire.
    pub fn descriptor(&self) -> Vec<WireNode> {
        self.subtree()
            .iter()
            .map(|n| WireNode {
                name: n.node.name.clone(),
                addr: n.node.addr.clone(),
                span: n.span as u32,
            })
            .collect()
    }
}

pub struct Branches<'a> {
    nodes: &'a [TreeNode],
    next: usize,
}

impl<'a> Iterator for Branches<'a> {
    type Item = Branch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next;
        let head = self.nodes.get(start)?;
        self.next = start + head.span;
        Some(Branch {
            start,
            nodes: &self.nodes[start..self.next],
        })
    }
}

/// Assigns spans to `nodes` and returns the depth of the resulting forest.
fn layout(nodes: &mut [TreeNode], fanout: usize) -> usize {
    let n = nodes.len();
    if n == 0 {
        return 0;
    }
    let chunks = n.min(fanout);
    let base = n / chunks;
    let extra = n % chunks;

    let mut depth = 0;
    let mut start = 0;
    for chunk in 0..chunks {
        let len = base + usize::from(chunk < extra);
        nodes[start].span = len;
        depth = depth.max(1 + layout(&mut nodes[start + 1..start + len], fanout));
        start += len;
    }
    depth
}

/// Returns the depth of a received forest, or `None` if the spans don't tile
/// it exactly.
fn measure(nodes: &[TreeNode]) -> Option<usize> {
    let mut depth = 0;
    let mut start = 0;
    while start < nodes.len() {
        let span = nodes[start].span;
        if span == 0 || start + span > nodes.len() {
            return None;
        }
        depth = depth.max(1 + measure(&nodes[start + 1..start + span])?);
        start += span;
    }
    Some(depth)
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateNode(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<NodeAddr> {
        (1..=n)
            .map(|i| NodeAddr::new(format!("n{}", i), format!("10.0.0.{}:6818", i)))
            .collect()
    }

    fn sizes(tree: &ForwardTree) -> Vec<usize> {
        tree.branches().map(|b| b.len()).collect()
    }

    #[test]
    fn seven_nodes_three_wide() {
        let tree = ForwardTree::build(targets(7), 3).unwrap();
        assert_eq!(sizes(&tree), vec![3, 2, 2]);
        let second = tree.branches().nth(1).unwrap();
        assert_eq!(second.names().collect::<Vec<_>>(), vec!["n4", "n5"]);
        assert_eq!(second.head().name, "n4");
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn small_sets_are_a_single_level() {
        let tree = ForwardTree::build(targets(4), 8).unwrap();
        assert_eq!(sizes(&tree), vec![1, 1, 1, 1]);
        assert!(tree.branches().all(|b| b.is_leaf()));
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn empty_and_invalid_input() {
        assert!(matches!(
            ForwardTree::build(vec![], 4),
            Err(Error::EmptyDispatch)
        ));
        assert!(matches!(
            ForwardTree::build(targets(3), 0),
            Err(Error::InvalidFanout)
        ));
        let mut dup = targets(3);
        dup.push(NodeAddr::new("n2", "elsewhere:1"));
        assert!(matches!(
            ForwardTree::build(dup, 2),
            Err(Error::DuplicateNode(name)) if name == "n2"
        ));
    }

    #[test]
    fn branches_are_balanced_and_cover_every_node() {
        for n in 1..=200 {
            for fanout in 1..=9 {
                let tree = ForwardTree::build(targets(n), fanout).unwrap();
                let sizes = sizes(&tree);
                assert!(sizes.len() <= fanout);
                assert_eq!(sizes.iter().sum::<usize>(), n);
                let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
                assert!(max - min <= 1, "n={} w={} sizes={:?}", n, fanout, sizes);
                assert!(measure(tree.nodes()).is_some());
            }
        }
    }

    #[test]
    fn depth_grows_logarithmically() {
        // 1 + 16 + 16*16 nodes fit in three levels of width 16 minus change
        let tree = ForwardTree::build(targets(4096), 16).unwrap();
        assert!(tree.depth() <= 4, "depth {}", tree.depth());
        let chain = ForwardTree::build(targets(5), 1).unwrap();
        assert_eq!(chain.depth(), 5);
    }

    #[test]
    fn descriptor_rebuilds_the_delegated_subtree() {
        let tree = ForwardTree::build(targets(40), 3).unwrap();
        let first = tree.branches().next().unwrap();
        let delegated = ForwardTree::from_descriptor(first.descriptor()).unwrap();
        assert_eq!(delegated.len(), first.len() - 1);
        assert_eq!(delegated.nodes(), first.subtree());
        assert_eq!(delegated.depth(), tree.depth() - 1);
    }

    #[test]
    fn descriptor_with_bad_spans_is_rejected() {
        let mut descriptor = ForwardTree::build(targets(9), 3)
            .unwrap()
            .branch(0)
            .descriptor();
        descriptor[0].span = 7;
        assert!(matches!(
            ForwardTree::from_descriptor(descriptor.clone()),
            Err(Error::MalformedDescriptor)
        ));
        descriptor[0].span = 0;
        assert!(matches!(
            ForwardTree::from_descriptor(descriptor),
            Err(Error::MalformedDescriptor)
        ));
    }
}
