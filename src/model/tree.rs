//! Decision tree: an ordered node list rooted at index 0.

use std::fmt;

use super::tiling::TilingDescriptor;
use crate::diagnostic::Diagnostic;
use crate::span::Span;

/// Marks an absent parent or child link.
pub const INVALID_NODE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureType {
    Numerical,
    Categorical,
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureType::Numerical => write!(f, "numerical"),
            FeatureType::Categorical => write!(f, "categorical"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Node {
    /// Split threshold; for a leaf, the leaf's prediction.
    pub threshold: f64,
    pub feature_index: i32,
    pub parent: i32,
    pub left_child: i32,
    pub right_child: i32,
    pub feature_type: FeatureType,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.left_child == INVALID_NODE && self.right_child == INVALID_NODE
    }
}

#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    num_features: usize,
    scale: f64,
    class_id: i8,
    tiling: TilingDescriptor,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
            && self.num_features == other.num_features
            && self.scale == other.scale
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            num_features: 0,
            scale: 1.0,
            class_id: 0,
            tiling: TilingDescriptor::default(),
        }
    }

    // ── Construction ──────────────────────────────────────────────

    /// Append a node with no links and return its index.
    pub fn new_node(&mut self, threshold: f64, feature_index: i32) -> i32 {
        self.nodes.push(Node {
            threshold,
            feature_index,
            parent: INVALID_NODE,
            left_child: INVALID_NODE,
            right_child: INVALID_NODE,
            feature_type: FeatureType::Numerical,
        });
        (self.nodes.len() - 1) as i32
    }

    pub fn set_node_parent(&mut self, node: i32, parent: i32) {
        self.nodes[node as usize].parent = parent;
    }

    pub fn set_node_left_child(&mut self, node: i32, child: i32) {
        self.nodes[node as usize].left_child = child;
    }

    pub fn set_node_right_child(&mut self, node: i32, child: i32) {
        self.nodes[node as usize].right_child = child;
    }

    pub fn set_node_feature_type(&mut self, node: i32, feature_type: FeatureType) {
        self.nodes[node as usize].feature_type = feature_type;
    }

    /// Link `left` and `right` under `node`, setting both parent links.
    pub fn set_children(&mut self, node: i32, left: i32, right: i32) {
        self.set_node_left_child(node, left);
        self.set_node_right_child(node, right);
        self.set_node_parent(left, node);
        self.set_node_parent(right, node);
    }

    pub fn set_number_of_features(&mut self, num_features: usize) {
        self.num_features = num_features;
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.scale = scale;
    }

    pub fn set_class_id(&mut self, class_id: i8) {
        self.class_id = class_id;
    }

    pub fn set_tiling(&mut self, tiling: TilingDescriptor) {
        self.tiling = tiling;
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: i32) -> &Node {
        &self.nodes[index as usize]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn class_id(&self) -> i8 {
        self.class_id
    }

    pub fn tiling(&self) -> &TilingDescriptor {
        &self.tiling
    }

    /// Number of levels from the root to the deepest leaf (1 for a lone leaf).
    pub fn depth(&self) -> usize {
        fn walk(tree: &Tree, node: i32) -> usize {
            let n = tree.node(node);
            if n.is_leaf() {
                return 1;
            }
            let left = if n.left_child == INVALID_NODE { 0 } else { walk(tree, n.left_child) };
            let right = if n.right_child == INVALID_NODE { 0 } else { walk(tree, n.right_child) };
            1 + left.max(right)
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(self, 0)
        }
    }

    // ── Invariants ────────────────────────────────────────────────

    /// Check the structural invariants: one root at index 0, in-range
    /// child links with matching parents, every node reachable.
    pub fn validate(&self) -> Result<(), Diagnostic> {
        if self.nodes.is_empty() {
            return Err(Diagnostic::fatal("tree has no nodes"));
        }
        if self.nodes[0].parent != INVALID_NODE {
            return Err(Diagnostic::fatal("root node 0 has a parent"));
        }
        let count = self.nodes.len() as i32;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 && node.parent == INVALID_NODE {
                return Err(Diagnostic::fatal(format!(
                    "node {} has no parent; a tree has exactly one root",
                    i
                )));
            }
            for child in [node.left_child, node.right_child] {
                if child == INVALID_NODE {
                    continue;
                }
                if child < 0 || child >= count {
                    return Err(Diagnostic::fatal(format!(
                        "node {} links to child {} outside 0..{}",
                        i, child, count
                    )));
                }
                if self.nodes[child as usize].parent != i as i32 {
                    return Err(Diagnostic::fatal(format!(
                        "node {} is a child of {} but records parent {}",
                        child, i, self.nodes[child as usize].parent
                    )));
                }
            }
            if (node.left_child == INVALID_NODE) != (node.right_child == INVALID_NODE) {
                return Err(Diagnostic::fatal(format!(
                    "node {} has exactly one child",
                    i
                )));
            }
        }

        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![0i32];
        while let Some(n) = stack.pop() {
            if std::mem::replace(&mut seen[n as usize], true) {
                return Err(Diagnostic::fatal(format!("node {} is reachable twice", n)));
            }
            let node = self.node(n);
            if !node.is_leaf() {
                stack.push(node.right_child);
                stack.push(node.left_child);
            }
        }
        if let Some(orphan) = seen.iter().position(|s| !s) {
            return Err(Diagnostic::fatal(format!(
                "node {} is not reachable from the root",
                orphan
            )));
        }
        Ok(())
    }

    // ── Evaluation ────────────────────────────────────────────────

    /// Walk from the root: `threshold < row[feature]` goes left, otherwise
    /// right; the reached leaf's threshold is the prediction.
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut node = &self.nodes[0];
        while !node.is_leaf() {
            let value = row[node.feature_index as usize];
            node = if node.threshold < value {
                &self.nodes[node.left_child as usize]
            } else {
                &self.nodes[node.right_child as usize]
            };
        }
        node.threshold
    }

    // ── Text form ─────────────────────────────────────────────────

    pub fn serialize(&self) -> String {
        let mut out = format!(
            "tree {} {} {} {}\n",
            self.num_features,
            self.scale,
            self.class_id,
            self.nodes.len()
        );
        for node in &self.nodes {
            out.push_str(&format!(
                "node {} {} {} {} {} {}\n",
                node.threshold,
                node.feature_index,
                node.parent,
                node.left_child,
                node.right_child,
                node.feature_type
            ));
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self, Diagnostic> {
        let mut lines = LineReader::new(text);
        Self::read_from(&mut lines)
    }

    pub(crate) fn read_from(lines: &mut LineReader<'_>) -> Result<Self, Diagnostic> {
        let (span, fields) = lines.expect("tree")?;
        if fields.len() != 4 {
            return Err(lines.malformed(span, "tree <features> <scale> <class> <nodes>"));
        }
        let mut tree = Tree::new();
        tree.num_features = parse_field(&fields[0], span)?;
        tree.scale = parse_field(&fields[1], span)?;
        tree.class_id = parse_field(&fields[2], span)?;
        let count: usize = parse_field(&fields[3], span)?;

        for _ in 0..count {
            let (span, fields) = lines.expect("node")?;
            if fields.len() != 6 {
                return Err(lines.malformed(
                    span,
                    "node <threshold> <feature> <parent> <left> <right> <type>",
                ));
            }
            let feature_type = match fields[5].as_str() {
                "numerical" => FeatureType::Numerical,
                "categorical" => FeatureType::Categorical,
                other => {
                    return Err(Diagnostic::error(
                        format!("unknown feature type '{}'", other),
                        span,
                    ))
                }
            };
            tree.nodes.push(Node {
                threshold: parse_field(&fields[0], span)?,
                feature_index: parse_field(&fields[1], span)?,
                parent: parse_field(&fields[2], span)?,
                left_child: parse_field(&fields[3], span)?,
                right_child: parse_field(&fields[4], span)?,
                feature_type,
            });
        }
        Ok(tree)
    }

    pub fn print_to_string(&self) -> String {
        format!(
            "NumberOfFeatures = {}, Scale = {}, NumberOfNodes = {}",
            self.num_features,
            self.scale,
            self.nodes.len()
        )
    }
}

// ─── Line reader for the text form ────────────────────────────────

/// Yields whitespace-split records with their spans; blank lines and
/// `#` comments are skipped.
pub(crate) struct LineReader<'a> {
    text: &'a str,
    offset: usize,
}

impl<'a> LineReader<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self { text, offset: 0 }
    }

    pub(crate) fn next_record(&mut self) -> Option<(Span, String, Vec<String>)> {
        while self.offset < self.text.len() {
            let rest = &self.text[self.offset..];
            let len = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
            let line = &rest[..len];
            let start = self.offset;
            self.offset += len;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut words = trimmed.split_whitespace().map(str::to_string);
            let keyword = words.next().unwrap_or_default();
            let span = Span::of_line(start, line.trim_end());
            return Some((span, keyword, words.collect()));
        }
        None
    }

    pub(crate) fn expect(&mut self, keyword: &str) -> Result<(Span, Vec<String>), Diagnostic> {
        match self.next_record() {
            Some((span, found, fields)) if found == keyword => Ok((span, fields)),
            Some((span, found, _)) => Err(Diagnostic::error(
                format!("expected '{}' record, found '{}'", keyword, found),
                span,
            )),
            None => Err(Diagnostic::error(
                format!("expected '{}' record, found end of input", keyword),
                Span::new(self.text.len() as u32, self.text.len() as u32),
            )),
        }
    }

    pub(crate) fn malformed(&self, span: Span, shape: &str) -> Diagnostic {
        Diagnostic::error("malformed record".to_string(), span).with_help(format!("expected `{}`", shape))
    }
}

pub(crate) fn parse_field<T: std::str::FromStr>(text: &str, span: Span) -> Result<T, Diagnostic> {
    text.parse()
        .map_err(|_| Diagnostic::error(format!("cannot parse '{}'", text), span))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root(0.5 on f0) -> [leaf 1.0, inner(2.5 on f1) -> [leaf 2.0, leaf 3.0]]
    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        tree.set_number_of_features(2);
        let root = tree.new_node(0.5, 0);
        let left = tree.new_node(1.0, -1);
        let right = tree.new_node(2.5, 1);
        tree.set_children(root, left, right);
        let rl = tree.new_node(2.0, -1);
        let rr = tree.new_node(3.0, -1);
        tree.set_children(right, rl, rr);
        tree
    }

    #[test]
    fn test_is_leaf() {
        let tree = sample_tree();
        assert!(!tree.node(0).is_leaf());
        assert!(tree.node(1).is_leaf());
        assert!(tree.node(4).is_leaf());
    }

    #[test]
    fn test_predict_goes_left_when_threshold_below_feature() {
        let tree = sample_tree();
        // 0.5 < 0.9 -> left leaf
        assert_eq!(tree.predict(&[0.9, 0.0]), 1.0);
        // 0.5 < 0.1 false -> right; 2.5 < 3.0 -> left
        assert_eq!(tree.predict(&[0.1, 3.0]), 2.0);
        assert_eq!(tree.predict(&[0.1, 1.0]), 3.0);
    }

    #[test]
    fn test_depth() {
        assert_eq!(sample_tree().depth(), 3);
        let mut lone = Tree::new();
        lone.new_node(4.0, -1);
        assert_eq!(lone.depth(), 1);
        assert_eq!(Tree::new().depth(), 0);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(sample_tree().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_orphans_and_bad_links() {
        assert!(Tree::new().validate().is_err());

        let mut tree = sample_tree();
        tree.new_node(9.0, -1);
        let err = tree.validate().unwrap_err();
        assert!(err.message.contains("no parent"), "{}", err.message);

        let mut tree = sample_tree();
        tree.set_node_left_child(2, 17);
        let err = tree.validate().unwrap_err();
        assert!(err.message.contains("outside"), "{}", err.message);

        let mut tree = sample_tree();
        tree.set_node_right_child(2, INVALID_NODE);
        assert!(tree.validate().is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut tree = sample_tree();
        tree.set_scale(0.125);
        tree.set_node_feature_type(2, FeatureType::Categorical);
        let text = tree.serialize();
        let back = Tree::deserialize(&text).unwrap();
        assert_eq!(back, tree);
        assert_eq!(back.node(2).feature_type, FeatureType::Categorical);
        assert_eq!(back.scale(), 0.125);
    }

    #[test]
    fn test_serialize_round_trips_awkward_floats() {
        let mut tree = Tree::new();
        tree.new_node(0.1 + 0.2, -1);
        tree.set_scale(1.0 / 3.0);
        let back = Tree::deserialize(&tree.serialize()).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_deserialize_reports_span() {
        let text = "tree 2 1 0 1\nnode 1.0 x -1 -1 -1 numerical\n";
        let err = Tree::deserialize(text).unwrap_err();
        assert!(err.message.contains("'x'"));
        assert_eq!(err.span.start, 13);
    }

    #[test]
    fn test_print_to_string() {
        assert_eq!(
            sample_tree().print_to_string(),
            "NumberOfFeatures = 2, Scale = 1, NumberOfNodes = 5"
        );
    }
}
