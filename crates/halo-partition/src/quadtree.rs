//! Dynamic quad-tree decomposition.
//!
//! Generalised to N dimensions: an inner node cuts its rectangle at an
//! origin point along a subset of axes, producing `2^k` children for `k`
//! cut axes (four children for a full 2-D split). Leaves are the
//! partitions, numbered in depth-first order, so moving an origin never
//! renumbers processes.

use halo_core::{Coord, ProcessId, Rect};
use smallvec::SmallVec;

use crate::error::PartitionError;
use crate::table::PartitionTable;
use crate::uniform::min_width;

/// Identifies a node of a [`QuadTree`]. Ids are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug)]
struct Split {
    origin: Coord,
    axes: SmallVec<[usize; 4]>,
    children: Vec<usize>,
}

#[derive(Clone, Debug)]
struct Node {
    live: bool,
    rect: Rect,
    level: u32,
    parent: Option<usize>,
    split: Option<Split>,
}

/// A partition tree whose leaves are the process partitions.
#[derive(Clone, Debug)]
pub struct QuadTree {
    nodes: Vec<Node>,
    /// Level to balance next; cycles from the deepest inner level to the root.
    next_level: Option<u32>,
    table: PartitionTable,
}

impl QuadTree {
    /// Build a tree with exactly `num_processes` leaves of near-equal size.
    ///
    /// Repeatedly halves the largest leaf, cutting as many axes as the
    /// remaining leaf budget allows, longest axes first.
    pub fn uniform(
        world: Rect,
        aoi: i32,
        toroidal: bool,
        num_processes: usize,
    ) -> Result<Self, PartitionError> {
        if world.ndim() == 0 || world.is_empty() {
            return Err(PartitionError::EmptyDomain);
        }
        if num_processes == 0 {
            return Err(PartitionError::ZeroProcesses);
        }
        let mw = min_width(aoi);
        let mut nodes = vec![Node {
            live: true,
            rect: world.clone(),
            level: 0,
            parent: None,
            split: None,
        }];
        loop {
            let leaves = leaves_under(&nodes, 0);
            if leaves.len() >= num_processes {
                break;
            }
            let remaining = num_processes - leaves.len();
            let mut order = leaves;
            order.sort_by_key(|&i| std::cmp::Reverse(node_ref(&nodes, i).rect.volume()));
            let mut did_split = false;
            for leaf in order {
                let rect = node_ref(&nodes, leaf).rect.clone();
                let mut axes: Vec<usize> = (0..rect.ndim())
                    .filter(|&a| rect.extent(a) >= 2 * mw)
                    .collect();
                axes.sort_by(|&a, &b| rect.extent(b).cmp(&rect.extent(a)).then(a.cmp(&b)));
                let mut k = axes.len();
                while k > 0 && (1usize << k) - 1 > remaining {
                    k -= 1;
                }
                if k == 0 {
                    continue;
                }
                axes.truncate(k);
                axes.sort_unstable();
                let origin = (0..rect.ndim())
                    .map(|a| rect.min[a] + rect.extent(a) / 2)
                    .collect();
                split_in_place(&mut nodes, leaf, origin, axes.into_iter().collect());
                did_split = true;
                break;
            }
            if !did_split {
                if aoi > 0 {
                    // Cuttable without a halo: keep that shape and let
                    // validation report the radius.
                    let bare = Self::uniform(world.clone(), 0, toroidal, num_processes)?;
                    let table = build_table(&bare.nodes, &world, aoi, toroidal, 0)?;
                    return Ok(Self {
                        nodes: bare.nodes,
                        next_level: None,
                        table,
                    });
                }
                return Err(PartitionError::NotSplittable {
                    detail: format!(
                        "{} cannot be cut into {num_processes} leaves at least {mw} wide",
                        world
                    ),
                });
            }
        }
        let table = build_table(&nodes, &world, aoi, toroidal, 0)?;
        Ok(Self {
            nodes,
            next_level: None,
            table,
        })
    }

    /// The current table; one partition per leaf.
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// All leaves in depth-first order. Leaf `i` is owned by `ProcessId(i)`.
    pub fn leaves(&self) -> Vec<NodeId> {
        leaves_under(&self.nodes, 0).into_iter().map(NodeId).collect()
    }

    /// The leaf assigned to `pid`.
    pub fn leaf_of(&self, pid: ProcessId) -> Option<NodeId> {
        self.leaves().get(pid.index()).copied()
    }

    /// The leaf whose rectangle contains `coord`.
    pub fn leaf_at(&self, coord: &[i32]) -> Option<NodeId> {
        let mut current = 0;
        if !node_ref(&self.nodes, current).rect.contains(coord) {
            return None;
        }
        while let Some(split) = &node_ref(&self.nodes, current).split {
            current = *split
                .children
                .iter()
                .find(|&&c| node_ref(&self.nodes, c).rect.contains(coord))?;
        }
        Some(NodeId(current))
    }

    /// Rectangle covered by `node`.
    pub fn rect(&self, node: NodeId) -> Result<&Rect, PartitionError> {
        Ok(&self.node(node)?.rect)
    }

    /// Cut point of an inner node (`None` for leaves).
    pub fn origin(&self, node: NodeId) -> Result<Option<&Coord>, PartitionError> {
        Ok(self.node(node)?.split.as_ref().map(|s| &s.origin))
    }

    /// Children of `node` (empty for leaves).
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>, PartitionError> {
        Ok(self
            .node(node)?
            .split
            .as_ref()
            .map(|s| s.children.iter().copied().map(NodeId).collect())
            .unwrap_or_default())
    }

    /// Parent of `node` (`None` for the root).
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>, PartitionError> {
        Ok(self.node(node)?.parent.map(NodeId))
    }

    /// Depth of `node` below the root.
    pub fn level(&self, node: NodeId) -> Result<u32, PartitionError> {
        Ok(self.node(node)?.level)
    }

    /// Level of the deepest leaf (0 for a single-leaf tree).
    pub fn depth(&self) -> u32 {
        leaves_under(&self.nodes, 0)
            .into_iter()
            .map(|i| node_ref(&self.nodes, i).level)
            .max()
            .unwrap_or(0)
    }

    /// Inner nodes at `level`, in depth-first order.
    pub fn inner_nodes_at(&self, level: u32) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            let n = node_ref(&self.nodes, i);
            if let Some(split) = &n.split {
                if n.level == level {
                    out.push(NodeId(i));
                } else {
                    stack.extend(split.children.iter().rev());
                }
            }
        }
        out
    }

    /// Cut `leaf` at `origin` along `axes`, adding `2^axes.len()` leaves.
    ///
    /// Changes the number of partitions; the resulting table covers the
    /// new leaf count.
    pub fn split(
        &mut self,
        leaf: NodeId,
        origin: Coord,
        axes: &[usize],
    ) -> Result<Vec<NodeId>, PartitionError> {
        let node = self.node(leaf)?;
        if node.split.is_some() {
            return Err(PartitionError::NotALeaf { node: leaf.0 });
        }
        let mw = min_width(self.table.aoi());
        let rect = &node.rect;
        let valid_axes = !axes.is_empty()
            && origin.len() == rect.ndim()
            && axes.iter().all(|&a| {
                a < rect.ndim() && origin[a] - rect.min[a] >= mw && rect.max[a] - origin[a] >= mw
            });
        if !valid_axes {
            return Err(PartitionError::NotSplittable {
                detail: format!("origin {origin:?} on axes {axes:?} does not cut {rect} cleanly"),
            });
        }
        let mut axes: SmallVec<[usize; 4]> = axes.iter().copied().collect();
        axes.sort_unstable();
        axes.dedup();
        let mut nodes = self.nodes.clone();
        split_in_place(&mut nodes, leaf.0, origin, axes);
        self.commit(nodes)?;
        Ok(self.children(leaf)?)
    }

    /// Collapse an inner node whose children are all leaves back into a leaf.
    pub fn merge(&mut self, node: NodeId) -> Result<(), PartitionError> {
        let split = self
            .node(node)?
            .split
            .clone()
            .ok_or(PartitionError::NotALeaf { node: node.0 })?;
        if split
            .children
            .iter()
            .any(|&c| node_ref(&self.nodes, c).split.is_some())
        {
            return Err(PartitionError::NotALeaf { node: node.0 });
        }
        let mut nodes = self.nodes.clone();
        for c in split.children {
            nodes[c].live = false;
        }
        nodes[node.0].split = None;
        self.commit(nodes)
    }

    /// Move the cut point of an inner node, reshaping its whole subtree.
    ///
    /// Descendant cut points are clamped into their reshaped rectangles.
    /// Fails, leaving the tree unchanged, if any resulting leaf would be
    /// narrower than `2 * aoi`.
    pub fn move_origin(&mut self, node: NodeId, origin: Coord) -> Result<(), PartitionError> {
        let mut nodes = self.nodes.clone();
        move_origin_in_place(&mut nodes, node.0, origin, min_width(self.table.aoi()))?;
        self.commit(nodes)
    }

    /// Shift cut points towards expensive leaves.
    ///
    /// Every inner node on the current balancing level moves its origin
    /// to the cost-weighted centroid of the centers of the leaves below
    /// it, which shrinks the expensive leaves. The level cycles from the
    /// deepest inner level up to the root across successive calls.
    /// Returns the new table if any origin moved.
    pub fn balance(&mut self, costs: &[f64]) -> Result<Option<PartitionTable>, PartitionError> {
        let leaves = leaves_under(&self.nodes, 0);
        if costs.len() != leaves.len() {
            return Err(PartitionError::CostLengthMismatch {
                expected: leaves.len(),
                got: costs.len(),
            });
        }
        let depth = self.depth();
        if depth == 0 {
            return Ok(None);
        }
        let level = self.next_level.filter(|&l| l < depth).unwrap_or(depth - 1);
        self.next_level = Some(if level == 0 { depth - 1 } else { level - 1 });

        let mw = min_width(self.table.aoi());
        let mut nodes = self.nodes.clone();
        let mut moved = false;
        for NodeId(inner) in self.inner_nodes_at(level) {
            let n = node_ref(&self.nodes, inner);
            let Some(split) = &n.split else { continue };
            let mut weight = 0.0f64;
            let mut moment = vec![0.0f64; n.rect.ndim()];
            for leaf in leaves_under(&self.nodes, inner) {
                let Some(pid) = leaves.iter().position(|&l| l == leaf) else {
                    continue;
                };
                let cost = costs[pid].max(0.0);
                let center = node_ref(&self.nodes, leaf).rect.center();
                weight += cost;
                for (m, c) in moment.iter_mut().zip(center.iter()) {
                    *m += cost * c;
                }
            }
            if weight <= 0.0 || !weight.is_finite() {
                continue;
            }
            let mut origin = split.origin.clone();
            for &a in &split.axes {
                let lo = n.rect.min[a] + mw;
                let hi = n.rect.max[a] - mw;
                origin[a] = ((moment[a] / weight).round() as i32).clamp(lo, hi.max(lo));
            }
            if origin == split.origin {
                continue;
            }
            let mut attempt = nodes.clone();
            if move_origin_in_place(&mut attempt, inner, origin, mw).is_ok() {
                nodes = attempt;
                moved = true;
            }
        }
        if !moved {
            return Ok(None);
        }
        self.commit(nodes)?;
        Ok(Some(self.table.clone()))
    }

    fn node(&self, id: NodeId) -> Result<&Node, PartitionError> {
        self.nodes
            .get(id.0)
            .filter(|n| n.live)
            .ok_or(PartitionError::UnknownNode { node: id.0 })
    }

    fn commit(&mut self, nodes: Vec<Node>) -> Result<(), PartitionError> {
        let table = build_table(
            &nodes,
            self.table.world(),
            self.table.aoi(),
            self.table.is_toroidal(),
            self.table.version() + 1,
        )?;
        self.nodes = nodes;
        self.table = table;
        Ok(())
    }
}

fn node_ref(nodes: &[Node], i: usize) -> &Node {
    &nodes[i]
}

fn leaves_under(nodes: &[Node], start: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![start];
    while let Some(i) = stack.pop() {
        match &node_ref(nodes, i).split {
            None => out.push(i),
            Some(split) => stack.extend(split.children.iter().rev()),
        }
    }
    out
}

fn child_rects(rect: &Rect, origin: &[i32], axes: &[usize]) -> Vec<Rect> {
    (0..1usize << axes.len())
        .map(|c| {
            let mut r = rect.clone();
            for (bit, &a) in axes.iter().enumerate() {
                if (c >> bit) & 1 == 1 {
                    r.min[a] = origin[a];
                } else {
                    r.max[a] = origin[a];
                }
            }
            r
        })
        .collect()
}

fn split_in_place(
    nodes: &mut Vec<Node>,
    leaf: usize,
    origin: Coord,
    axes: SmallVec<[usize; 4]>,
) {
    let (rect, level) = {
        let n = node_ref(nodes, leaf);
        (n.rect.clone(), n.level)
    };
    let mut children = Vec::new();
    for r in child_rects(&rect, &origin, &axes) {
        children.push(nodes.len());
        nodes.push(Node {
            live: true,
            rect: r,
            level: level + 1,
            parent: Some(leaf),
            split: None,
        });
    }
    nodes[leaf].split = Some(Split {
        origin,
        axes,
        children,
    });
}

fn move_origin_in_place(
    nodes: &mut [Node],
    node: usize,
    origin: Coord,
    mw: i32,
) -> Result<(), PartitionError> {
    let n = nodes
        .get(node)
        .filter(|n| n.live)
        .ok_or(PartitionError::UnknownNode { node })?;
    let split = n.split.as_ref().ok_or(PartitionError::NotALeaf { node })?;
    if origin.len() != n.rect.ndim() {
        return Err(PartitionError::NotSplittable {
            detail: format!("origin {origin:?} has the wrong dimensionality"),
        });
    }
    for &a in &split.axes {
        if origin[a] - n.rect.min[a] < mw || n.rect.max[a] - origin[a] < mw {
            return Err(PartitionError::NotSplittable {
                detail: format!("origin {origin:?} leaves a child of {} thinner than {mw}", n.rect),
            });
        }
    }
    if let Some(split) = nodes[node].split.as_mut() {
        split.origin = origin;
    }
    relayout(nodes, node, mw)
}

/// Recompute the rectangles below `node` from its rectangle and origin.
fn relayout(nodes: &mut [Node], node: usize, mw: i32) -> Result<(), PartitionError> {
    let n = node_ref(nodes, node);
    let Some(split) = n.split.clone() else {
        return Ok(());
    };
    let rects = child_rects(&n.rect, &split.origin, &split.axes);
    for (&child, rect) in split.children.iter().zip(rects) {
        if rect.min_extent() < mw {
            return Err(PartitionError::NotSplittable {
                detail: format!("child {rect} would be thinner than {mw}"),
            });
        }
        let c = &mut nodes[child];
        c.rect = rect;
        if let Some(cs) = c.split.as_mut() {
            for &a in &cs.axes {
                let lo = c.rect.min[a] + mw;
                let hi = c.rect.max[a] - mw;
                if lo > hi {
                    return Err(PartitionError::NotSplittable {
                        detail: format!("{} is too thin to stay split", c.rect),
                    });
                }
                cs.origin[a] = cs.origin[a].clamp(lo, hi);
            }
        }
        relayout(nodes, child, mw)?;
    }
    Ok(())
}

fn build_table(
    nodes: &[Node],
    world: &Rect,
    aoi: i32,
    toroidal: bool,
    version: u64,
) -> Result<PartitionTable, PartitionError> {
    let rects = leaves_under(nodes, 0)
        .into_iter()
        .map(|i| node_ref(nodes, i).rect.clone())
        .collect();
    Ok(PartitionTable::new(world.clone(), aoi, toroidal, rects)?.with_version(version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn world() -> Rect {
        Rect::from_extents(&[100, 100])
    }

    #[test]
    fn four_leaves_is_one_full_split() {
        let t = QuadTree::uniform(world(), 5, true, 4).unwrap();
        assert_eq!(t.depth(), 1);
        assert_eq!(t.children(t.root()).unwrap().len(), 4);
        assert_eq!(t.origin(t.root()).unwrap().unwrap().as_slice(), &[50, 50]);
        assert_eq!(t.table().num_processes(), 4);
    }

    #[test]
    fn odd_counts_use_partial_splits() {
        for n in [2usize, 3, 5, 6, 7, 10] {
            let t = QuadTree::uniform(world(), 2, false, n).unwrap();
            assert_eq!(t.leaves().len(), n, "n = {n}");
            t.table().validate().unwrap();
        }
    }

    #[test]
    fn thin_leaves_report_the_aoi() {
        let err = QuadTree::uniform(Rect::from_extents(&[20, 20]), 5, false, 9).unwrap_err();
        assert!(matches!(err, PartitionError::AoiTooLarge { aoi: 5, .. }));
    }

    #[test]
    fn leaf_at_matches_table_owner() {
        let t = QuadTree::uniform(world(), 2, false, 7).unwrap();
        for coord in [[0, 0], [99, 99], [50, 3], [12, 77]] {
            let leaf = t.leaf_at(&coord).unwrap();
            let pid = t.table().owner_of(&coord).unwrap();
            assert_eq!(t.leaf_of(pid), Some(leaf));
        }
        assert_eq!(t.leaf_at(&[100, 0]), None);
    }

    #[test]
    fn split_then_merge_restores_the_table() {
        let mut t = QuadTree::uniform(world(), 2, false, 4).unwrap();
        let before = t.table().rects().to_vec();
        let leaf = t.leaves()[0];
        let kids = t.split(leaf, smallvec![25, 25], &[0, 1]).unwrap();
        assert_eq!(kids.len(), 4);
        assert_eq!(t.table().num_processes(), 7);
        assert_eq!(t.depth(), 2);
        t.merge(leaf).unwrap();
        assert_eq!(t.table().rects(), before.as_slice());
        assert!(t.rect(kids[0]).is_err());
    }

    #[test]
    fn merge_requires_leaf_children() {
        let mut t = QuadTree::uniform(world(), 2, false, 4).unwrap();
        let leaf = t.leaves()[0];
        t.split(leaf, smallvec![25, 25], &[0]).unwrap();
        assert!(matches!(t.merge(t.root()), Err(PartitionError::NotALeaf { .. })));
        assert!(matches!(
            t.split(leaf, smallvec![25, 25], &[1]),
            Err(PartitionError::NotALeaf { .. })
        ));
    }

    #[test]
    fn move_origin_reshapes_children() {
        let mut t = QuadTree::uniform(world(), 2, false, 4).unwrap();
        t.move_origin(t.root(), smallvec![30, 60]).unwrap();
        let rects = t.table().rects();
        assert_eq!(rects[0], Rect::new(smallvec![0, 0], smallvec![30, 60]));
        assert_eq!(rects[3], Rect::new(smallvec![30, 60], smallvec![100, 100]));
        assert_eq!(t.table().version(), 1);
    }

    #[test]
    fn move_origin_rejects_thin_children() {
        let mut t = QuadTree::uniform(world(), 5, false, 4).unwrap();
        let before = t.table().clone();
        assert!(t.move_origin(t.root(), smallvec![5, 50]).is_err());
        assert_eq!(t.table(), &before);
    }

    #[test]
    fn balance_shrinks_the_expensive_leaf() {
        let mut t = QuadTree::uniform(world(), 2, false, 4).unwrap();
        let hot = t.table().rects()[0].volume();
        let table = t.balance(&[10.0, 1.0, 1.0, 1.0]).unwrap().unwrap();
        assert!(table.rects()[0].volume() < hot);
        table.validate().unwrap();
    }

    #[test]
    fn even_costs_do_not_move_origins() {
        let mut t = QuadTree::uniform(world(), 2, false, 4).unwrap();
        assert_eq!(t.balance(&[1.0; 4]).unwrap(), None);
    }

    #[test]
    fn balance_level_cycles_towards_the_root() {
        let mut t = QuadTree::uniform(world(), 2, false, 16).unwrap();
        assert_eq!(t.depth(), 2);
        let mut costs = vec![1.0; 16];
        costs[0] = 50.0;
        // Level 1 first: only the first quadrant's inner node reacts.
        let first = t.balance(&costs).unwrap().unwrap();
        assert_eq!(t.origin(t.root()).unwrap().unwrap().as_slice(), &[50, 50]);
        assert!(first.rects()[0].volume() < 625);
        // Then the root.
        t.balance(&costs).unwrap().unwrap();
        assert_ne!(t.origin(t.root()).unwrap().unwrap().as_slice(), &[50, 50]);
    }
}
