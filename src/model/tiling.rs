//! Tiling: grouping a tree's nodes into fixed-size tiles.
//!
//! A `TilingDescriptor` assigns every node a tile id. `TiledTree` turns
//! that assignment into an ordered list of tiles, each with a shape id
//! drawn from the enumeration of binary-tree shapes, and packs the tiles
//! into flat per-field arrays for either array or sparse layout.

use std::collections::{HashMap, VecDeque};

use super::tree::{Tree, INVALID_NODE};
use crate::diagnostic::Diagnostic;

/// Largest supported tile width; the lookup table grows as Catalan(n) * 2^n.
pub const MAX_TILE_SIZE: u32 = 8;

/// Tile-shape id used for leaf tiles and every tile of a unit tiling.
pub const SINGLE_NODE_SHAPE: i32 = 0;

/// How a tree's tiles are placed in the model buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Packing {
    /// Children of slot `i` at `i*(tile_size+1)+1+k`.
    Array,
    /// Tiles in BFS order with an explicit first-child index per tile.
    Sparse,
}

// ─── Descriptor ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingDescriptor {
    tile_size: u32,
    max_tile_size: u32,
    tile_ids: Vec<i32>,
}

impl Default for TilingDescriptor {
    fn default() -> Self {
        Self {
            tile_size: 1,
            max_tile_size: 1,
            tile_ids: Vec::new(),
        }
    }
}

impl TilingDescriptor {
    /// Every node is its own tile.
    pub fn unit(tree: &Tree) -> Self {
        Self {
            tile_size: 1,
            max_tile_size: 1,
            tile_ids: (0..tree.num_nodes() as i32).collect(),
        }
    }

    /// Greedy level-order tiling. A tile absorbs internal nodes in BFS
    /// order from its root until it holds `tile_size` nodes; each exit
    /// roots a new tile. Leaves always sit alone.
    pub fn uniform(tree: &Tree, tile_size: u32) -> Result<Self, Diagnostic> {
        check_tile_size(tile_size)?;
        if tree.num_nodes() == 0 {
            return Err(Diagnostic::fatal("cannot tile an empty tree"));
        }
        if tile_size == 1 {
            return Ok(Self::unit(tree));
        }

        let mut tile_ids = vec![-1; tree.num_nodes()];
        let mut max_tile_size = 1;
        let mut next_id = 0;
        let mut roots = VecDeque::from([0i32]);

        while let Some(root) = roots.pop_front() {
            let id = next_id;
            next_id += 1;
            if tree.node(root).is_leaf() {
                tile_ids[root as usize] = id;
                continue;
            }

            let mut members = 0;
            let mut frontier = VecDeque::from([root]);
            while let Some(n) = frontier.pop_front() {
                let node = tree.node(n);
                if members == tile_size || node.is_leaf() {
                    roots.push_back(n);
                    continue;
                }
                tile_ids[n as usize] = id;
                members += 1;
                frontier.push_back(node.left_child);
                frontier.push_back(node.right_child);
            }
            max_tile_size = max_tile_size.max(members);
        }

        Ok(Self {
            tile_size,
            max_tile_size,
            tile_ids,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn max_tile_size(&self) -> u32 {
        self.max_tile_size
    }

    pub fn tile_ids(&self) -> &[i32] {
        &self.tile_ids
    }

    /// Whether tile ids have been assigned for a tree of `num_nodes`.
    pub fn covers(&self, num_nodes: usize) -> bool {
        num_nodes > 0 && self.tile_ids.len() == num_nodes
    }

    pub fn number_of_tile_shapes(&self) -> usize {
        number_of_tile_shapes(self.tile_size)
    }

    pub fn number_of_outcomes(&self) -> usize {
        number_of_outcomes(self.tile_size)
    }
}

fn check_tile_size(tile_size: u32) -> Result<(), Diagnostic> {
    if tile_size == 0 || tile_size > MAX_TILE_SIZE {
        return Err(Diagnostic::fatal(format!(
            "tile size {} is outside 1..={}",
            tile_size, MAX_TILE_SIZE
        )));
    }
    Ok(())
}

// ─── Tile shapes ──────────────────────────────────────────────────

/// Binary-tree shape of a tile's nodes. `Exit` marks an edge leaving the tile.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TileShape {
    Exit,
    Node(Box<TileShape>, Box<TileShape>),
}

impl TileShape {
    pub fn node_count(&self) -> usize {
        match self {
            TileShape::Exit => 0,
            TileShape::Node(l, r) => 1 + l.node_count() + r.node_count(),
        }
    }

    /// Nodes of the shape in level order.
    fn level_order(&self) -> Vec<&TileShape> {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self]);
        while let Some(s) = queue.pop_front() {
            if let TileShape::Node(l, r) = s {
                order.push(s);
                queue.push_back(l.as_ref());
                queue.push_back(r.as_ref());
            }
        }
        order
    }

    /// Index (left to right) of the exit reached when the node at
    /// level-order position `p` goes left iff bit `p` of `outcome` is set.
    pub fn exit_for(&self, outcome: u32) -> usize {
        let order = self.level_order();
        let position = |target: &TileShape| {
            order
                .iter()
                .position(|s| std::ptr::eq(*s, target))
                .unwrap_or(0)
        };

        let mut exits_left_of = 0;
        let mut current = self;
        while let TileShape::Node(l, r) = current {
            let p = position(current);
            if outcome & (1 << p) != 0 {
                current = l.as_ref();
            } else {
                exits_left_of += l.node_count() + 1;
                current = r.as_ref();
            }
        }
        exits_left_of
    }

    fn all_with(nodes: usize) -> Vec<TileShape> {
        if nodes == 0 {
            return vec![TileShape::Exit];
        }
        let mut shapes = Vec::new();
        for left in 0..nodes {
            let lefts = Self::all_with(left);
            let rights = Self::all_with(nodes - 1 - left);
            for l in &lefts {
                for r in &rights {
                    shapes.push(TileShape::Node(Box::new(l.clone()), Box::new(r.clone())));
                }
            }
        }
        shapes
    }
}

fn catalan(n: u64) -> u64 {
    // C(k+1) = C(k) * 2(2k+1) / (k+2)
    (0..n).fold(1, |c, k| c * 2 * (2 * k + 1) / (k + 2))
}

/// `Σ_{k=1..n} Catalan(k)`: all shapes with 1..=n nodes.
pub fn number_of_tile_shapes(tile_size: u32) -> usize {
    (1..=tile_size as u64).map(catalan).sum::<u64>() as usize
}

pub fn number_of_outcomes(tile_size: u32) -> usize {
    1usize << tile_size
}

/// Deterministic enumeration of every tile shape for one tile width.
#[derive(Clone, Debug)]
pub struct ShapeTable {
    tile_size: u32,
    shapes: Vec<TileShape>,
    ids: HashMap<TileShape, i32>,
}

impl ShapeTable {
    pub fn new(tile_size: u32) -> Result<Self, Diagnostic> {
        check_tile_size(tile_size)?;
        let shapes: Vec<TileShape> = (1..=tile_size as usize)
            .flat_map(TileShape::all_with)
            .collect();
        let ids = shapes
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as i32))
            .collect();
        Ok(Self {
            tile_size,
            shapes,
            ids,
        })
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn shape(&self, id: i32) -> Option<&TileShape> {
        self.shapes.get(id as usize)
    }

    pub fn id_of(&self, shape: &TileShape) -> Option<i32> {
        self.ids.get(shape).copied()
    }

    /// Row-major `[shape][outcome] -> exit index`.
    pub fn lookup_table(&self) -> Vec<i8> {
        let outcomes = number_of_outcomes(self.tile_size) as u32;
        let mut lut = Vec::with_capacity(self.shapes.len() * outcomes as usize);
        for shape in &self.shapes {
            for outcome in 0..outcomes {
                lut.push(shape.exit_for(outcome) as i8);
            }
        }
        lut
    }
}

// ─── Tiled tree ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    /// Member nodes in level order within the tile.
    pub nodes: Vec<i32>,
    pub shape_id: i32,
    /// Child tiles (indices into `TiledTree::tiles`), one per exit, left to right.
    pub children: Vec<usize>,
    pub is_leaf: bool,
}

/// Per-tree flat arrays, one entry (or `tile_size` entries) per tile slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PackedTree {
    pub thresholds: Vec<f64>,
    pub feature_indices: Vec<i32>,
    pub tile_shape_ids: Vec<i32>,
    pub child_indices: Vec<i32>,
    pub num_tiles: usize,
}

#[derive(Clone, Debug)]
pub struct TiledTree {
    tile_size: u32,
    tiles: Vec<Tile>,
}

impl TiledTree {
    /// Tile `tree` with its own descriptor if that matches `tile_size`,
    /// otherwise with a fresh uniform tiling.
    pub fn for_tree(tree: &Tree, tile_size: u32, shapes: &ShapeTable) -> Result<Self, Diagnostic> {
        let own = tree.tiling();
        if own.tile_size() == tile_size && own.covers(tree.num_nodes()) {
            Self::new(tree, own, shapes)
        } else {
            Self::new(tree, &TilingDescriptor::uniform(tree, tile_size)?, shapes)
        }
    }

    pub fn new(tree: &Tree, tiling: &TilingDescriptor, shapes: &ShapeTable) -> Result<Self, Diagnostic> {
        if !tiling.covers(tree.num_nodes()) {
            return Err(Diagnostic::fatal(format!(
                "tiling assigns {} nodes but the tree has {}",
                tiling.tile_ids().len(),
                tree.num_nodes()
            )));
        }
        let ids = tiling.tile_ids();
        let mut tiles: Vec<Tile> = Vec::new();
        let mut queue = VecDeque::from([0i32]);

        while let Some(root) = queue.pop_front() {
            let id = ids[root as usize];
            let mut nodes = Vec::new();
            let mut exits = Vec::new();
            let shape = build_shape(tree, ids, id, root, &mut exits);
            let mut frontier = VecDeque::from([root]);
            while let Some(n) = frontier.pop_front() {
                if ids[n as usize] != id {
                    continue;
                }
                nodes.push(n);
                let node = tree.node(n);
                if !node.is_leaf() {
                    frontier.push_back(node.left_child);
                    frontier.push_back(node.right_child);
                }
            }

            let is_leaf = tree.node(root).is_leaf();
            if is_leaf && nodes.len() != 1 {
                return Err(Diagnostic::fatal(format!(
                    "leaf {} shares tile {} with other nodes",
                    root, id
                )));
            }
            if nodes.len() > tiling.tile_size() as usize {
                return Err(Diagnostic::fatal(format!(
                    "tile {} holds {} nodes, more than tile size {}",
                    id,
                    nodes.len(),
                    tiling.tile_size()
                )));
            }
            let shape_id = if is_leaf {
                SINGLE_NODE_SHAPE
            } else {
                shapes.id_of(&shape).ok_or_else(|| {
                    Diagnostic::fatal(format!("tile {} has no shape of width {}", id, shapes.tile_size))
                })?
            };

            let first_child = tiles.len() + 1 + queue.len();
            let children = (first_child..first_child + exits.len()).collect();
            queue.extend(exits);
            tiles.push(Tile {
                nodes,
                shape_id,
                children,
                is_leaf,
            });
        }

        let assigned: usize = tiles.iter().map(|t| t.nodes.len()).sum();
        if assigned != tree.num_nodes() {
            return Err(Diagnostic::fatal(
                "tiling does not cover every node reachable from the root",
            ));
        }

        Ok(Self {
            tile_size: tiling.tile_size(),
            tiles,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Tiles in BFS order; index 0 is the root tile.
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Slot of every tile in array packing.
    fn array_slots(&self) -> Vec<usize> {
        let stride = self.tile_size as usize + 1;
        let mut slots = vec![0usize; self.tiles.len()];
        for (i, tile) in self.tiles.iter().enumerate() {
            for (k, &child) in tile.children.iter().enumerate() {
                slots[child] = slots[i] * stride + 1 + k;
            }
        }
        slots
    }

    pub fn tile_count(&self, packing: Packing) -> usize {
        match packing {
            Packing::Array => self.array_slots().into_iter().max().unwrap_or(0) + 1,
            Packing::Sparse => self.tiles.len(),
        }
    }

    pub fn pack(&self, tree: &Tree, packing: Packing) -> PackedTree {
        let width = self.tile_size as usize;
        let count = self.tile_count(packing);
        let mut packed = PackedTree {
            thresholds: vec![0.0; count * width],
            feature_indices: vec![INVALID_NODE; count * width],
            tile_shape_ids: vec![SINGLE_NODE_SHAPE; count],
            child_indices: Vec::new(),
            num_tiles: count,
        };

        let slots = match packing {
            Packing::Array => self.array_slots(),
            Packing::Sparse => {
                packed.child_indices = self
                    .tiles
                    .iter()
                    .map(|t| t.children.first().map_or(INVALID_NODE, |&c| c as i32))
                    .collect();
                (0..self.tiles.len()).collect()
            }
        };

        for (tile, &slot) in self.tiles.iter().zip(&slots) {
            let base = slot * width;
            packed.tile_shape_ids[slot] = tile.shape_id;
            for j in 0..width {
                let node = tree.node(tile.nodes[j.min(tile.nodes.len() - 1)]);
                packed.thresholds[base + j] = node.threshold;
                packed.feature_indices[base + j] = if tile.is_leaf {
                    INVALID_NODE
                } else {
                    node.feature_index
                };
            }
        }
        packed
    }
}

/// Shape of tile `id` rooted at `node`; exits are collected left to right.
fn build_shape(tree: &Tree, ids: &[i32], id: i32, node: i32, exits: &mut Vec<i32>) -> TileShape {
    let n = tree.node(node);
    if n.is_leaf() {
        return TileShape::Node(Box::new(TileShape::Exit), Box::new(TileShape::Exit));
    }
    let side = |child: i32, exits: &mut Vec<i32>| {
        if child != INVALID_NODE && ids[child as usize] == id {
            build_shape(tree, ids, id, child, exits)
        } else {
            exits.push(child);
            TileShape::Exit
        }
    };
    let left = side(n.left_child, exits);
    let right = side(n.right_child, exits);
    TileShape::Node(Box::new(left), Box::new(right))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Complete tree of depth 3: internal 0,1,2; leaves 3,4,5,6.
    fn complete_tree() -> Tree {
        let mut tree = Tree::new();
        tree.set_number_of_features(3);
        let root = tree.new_node(0.5, 0);
        let a = tree.new_node(1.5, 1);
        let b = tree.new_node(2.5, 2);
        tree.set_children(root, a, b);
        let leaves: Vec<i32> = (0..4).map(|i| tree.new_node(10.0 + i as f64, -1)).collect();
        tree.set_children(a, leaves[0], leaves[1]);
        tree.set_children(b, leaves[2], leaves[3]);
        tree
    }

    /// Right spine: 0 -> (leaf 1, 2 -> (leaf 3, leaf 4)).
    fn spine_tree() -> Tree {
        let mut tree = Tree::new();
        let root = tree.new_node(0.5, 0);
        let l = tree.new_node(7.0, -1);
        let r = tree.new_node(1.5, 1);
        tree.set_children(root, l, r);
        let rl = tree.new_node(8.0, -1);
        let rr = tree.new_node(9.0, -1);
        tree.set_children(r, rl, rr);
        tree
    }

    #[test]
    fn test_shape_counts() {
        assert_eq!(number_of_tile_shapes(1), 1);
        assert_eq!(number_of_tile_shapes(2), 3);
        assert_eq!(number_of_tile_shapes(3), 8);
        assert_eq!(number_of_tile_shapes(4), 22);
        assert_eq!(number_of_outcomes(3), 8);
        for n in 1..=4 {
            assert_eq!(ShapeTable::new(n).unwrap().len(), number_of_tile_shapes(n));
        }
    }

    #[test]
    fn test_tile_size_bounds() {
        assert!(ShapeTable::new(0).is_err());
        assert!(ShapeTable::new(MAX_TILE_SIZE + 1).is_err());
        assert!(TilingDescriptor::uniform(&complete_tree(), 0).is_err());
    }

    #[test]
    fn test_single_node_lookup() {
        let table = ShapeTable::new(1).unwrap();
        // set bit -> left exit 0, clear -> right exit 1
        assert_eq!(table.lookup_table(), vec![1, 0]);
    }

    #[test]
    fn test_balanced_three_node_lookup() {
        let table = ShapeTable::new(3).unwrap();
        let balanced = TileShape::Node(
            Box::new(TileShape::Node(Box::new(TileShape::Exit), Box::new(TileShape::Exit))),
            Box::new(TileShape::Node(Box::new(TileShape::Exit), Box::new(TileShape::Exit))),
        );
        let id = table.id_of(&balanced).unwrap() as usize;
        let lut = table.lookup_table();
        let row = &lut[id * 8..id * 8 + 8];
        // bit0 root, bit1 left child, bit2 right child
        assert_eq!(row[0b011], 0);
        assert_eq!(row[0b001], 1);
        assert_eq!(row[0b100], 2);
        assert_eq!(row[0b000], 3);
    }

    #[test]
    fn test_unit_tiling() {
        let tree = complete_tree();
        let tiling = TilingDescriptor::unit(&tree);
        assert_eq!(tiling.tile_ids(), &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(tiling.max_tile_size(), 1);
    }

    #[test]
    fn test_uniform_tiling_keeps_leaves_alone() {
        let tree = complete_tree();
        let tiling = TilingDescriptor::uniform(&tree, 3).unwrap();
        let ids = tiling.tile_ids();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
        let leaf_ids: Vec<i32> = ids[3..].to_vec();
        let mut dedup = leaf_ids.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 4);
        assert_eq!(tiling.max_tile_size(), 3);
    }

    #[test]
    fn test_array_packing_unit_tiles() {
        let tree = spine_tree();
        let shapes = ShapeTable::new(1).unwrap();
        let tiled = TiledTree::for_tree(&tree, 1, &shapes).unwrap();
        // root 0, leaf at 1, inner at 2, its leaves at 5 and 6
        assert_eq!(tiled.tile_count(Packing::Array), 7);
        assert_eq!(tiled.tile_count(Packing::Sparse), 5);

        let packed = tiled.pack(&tree, Packing::Array);
        assert_eq!(packed.thresholds, vec![0.5, 7.0, 1.5, 0.0, 0.0, 8.0, 9.0]);
        assert_eq!(packed.feature_indices, vec![0, -1, 1, -1, -1, -1, -1]);
        assert!(packed.child_indices.is_empty());
    }

    #[test]
    fn test_sparse_packing_child_indices() {
        let tree = spine_tree();
        let shapes = ShapeTable::new(1).unwrap();
        let tiled = TiledTree::for_tree(&tree, 1, &shapes).unwrap();
        let packed = tiled.pack(&tree, Packing::Sparse);
        assert_eq!(packed.thresholds, vec![0.5, 7.0, 1.5, 8.0, 9.0]);
        assert_eq!(packed.child_indices, vec![1, -1, 3, -1, -1]);
    }

    #[test]
    fn test_tiled_packing_pads_with_last_node() {
        let tree = spine_tree();
        let shapes = ShapeTable::new(4).unwrap();
        let tiled = TiledTree::for_tree(&tree, 4, &shapes).unwrap();
        // one internal tile {0, 2} and three leaf tiles
        assert_eq!(tiled.tiles().len(), 4);
        let packed = tiled.pack(&tree, Packing::Sparse);
        assert_eq!(&packed.thresholds[..4], &[0.5, 1.5, 1.5, 1.5]);
        assert_eq!(&packed.feature_indices[..4], &[0, 1, 1, 1]);
        assert_eq!(&packed.thresholds[4..8], &[7.0; 4]);
        assert_eq!(&packed.feature_indices[4..8], &[-1; 4]);
        assert_eq!(packed.tile_shape_ids[1], SINGLE_NODE_SHAPE);
    }

    #[test]
    fn test_explicit_descriptor_is_used() {
        let mut tree = spine_tree();
        tree.set_tiling(TilingDescriptor::uniform(&tree, 2).unwrap());
        let shapes = ShapeTable::new(2).unwrap();
        let tiled = TiledTree::for_tree(&tree, 2, &shapes).unwrap();
        assert_eq!(tiled.tiles()[0].nodes, vec![0, 2]);
        assert_eq!(tiled.tiles()[0].children.len(), 3);
    }
}
