//! Logical decision-forest model.
//!
//! A `Forest` owns its trees by value; node and tree indices are stable
//! once assigned. Tiling and element types are layered on top in
//! `tiling` and `types`, and `serialize` flattens a forest into the host
//! arrays the synthesized initializers copy from.

pub mod serialize;
pub mod tiling;
pub mod tree;
pub mod types;

use std::fmt;

use crate::diagnostic::Diagnostic;
use crate::span::Span;
use tree::{parse_field, LineReader};

pub use tiling::{Packing, TiledTree, TilingDescriptor};
pub use tree::{FeatureType, Node, Tree, INVALID_NODE};
pub use types::{EnsembleType, ScalarType, TreeType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReductionType {
    Add,
    Voting,
}

impl fmt::Display for ReductionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionType::Add => write!(f, "add"),
            ReductionType::Voting => write!(f, "voting"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub type_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Forest {
    features: Vec<Feature>,
    trees: Vec<Tree>,
    pub reduction: ReductionType,
    num_classes: u32,
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl Forest {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            trees: Vec::new(),
            reduction: ReductionType::Add,
            num_classes: 0,
        }
    }

    pub fn add_feature(&mut self, name: impl Into<String>, type_name: impl Into<String>) {
        self.features.push(Feature {
            name: name.into(),
            type_name: type_name.into(),
        });
    }

    /// Append an empty tree sized for the forest's current feature set.
    pub fn new_tree(&mut self) -> &mut Tree {
        let mut tree = Tree::new();
        tree.set_number_of_features(self.features.len());
        self.trees.push(tree);
        let last = self.trees.len() - 1;
        &mut self.trees[last]
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn tree(&self, index: usize) -> &Tree {
        &self.trees[index]
    }

    pub fn tree_mut(&mut self, index: usize) -> &mut Tree {
        &mut self.trees[index]
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn num_classes(&self) -> u32 {
        self.num_classes
    }

    pub fn set_num_classes(&mut self, num_classes: u32) {
        self.num_classes = num_classes;
    }

    pub fn is_multi_class_classifier(&self) -> bool {
        self.num_classes > 1
    }

    /// Class id of every tree in forest order.
    pub fn class_ids(&self) -> Vec<i8> {
        self.trees.iter().map(Tree::class_id).collect()
    }

    pub fn validate(&self) -> Result<(), Diagnostic> {
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate()
                .map_err(|d| d.with_note(format!("in tree {}", i)))?;
            for node in tree.nodes().iter().filter(|n| !n.is_leaf()) {
                if node.feature_index < 0 || node.feature_index as usize >= self.num_features() {
                    return Err(Diagnostic::fatal(format!(
                        "tree {} splits on feature {} but the forest has {} features",
                        i,
                        node.feature_index,
                        self.num_features()
                    )));
                }
            }
        }
        Ok(())
    }

    /// `Add` sums the tree predictions; `Voting` picks the most frequent
    /// prediction, ties going to the smallest value.
    pub fn predict(&self, row: &[f64]) -> f64 {
        let predictions = self.trees.iter().map(|t| t.predict(row));
        match self.reduction {
            ReductionType::Add => predictions.sum(),
            ReductionType::Voting => {
                let mut votes: Vec<f64> = predictions.collect();
                votes.sort_by(f64::total_cmp);
                let mut best = (0.0, 0usize);
                for run in votes.chunk_by(|a, b| a == b) {
                    if run.len() > best.1 {
                        best = (run[0], run.len());
                    }
                }
                best.0
            }
        }
    }

    // ── Text form ─────────────────────────────────────────────────

    pub fn serialize(&self) -> String {
        let mut out = format!(
            "forest {} {} {} {}\n",
            self.reduction,
            self.num_classes,
            self.features.len(),
            self.trees.len()
        );
        for feature in &self.features {
            out.push_str(&format!("feature {} {}\n", feature.name, feature.type_name));
        }
        for tree in &self.trees {
            out.push_str(&tree.serialize());
        }
        out
    }

    pub fn deserialize(text: &str) -> Result<Self, Diagnostic> {
        let mut lines = LineReader::new(text);
        let (span, fields) = lines.expect("forest")?;
        if fields.len() != 4 {
            return Err(lines.malformed(span, "forest <reduction> <classes> <features> <trees>"));
        }
        let mut forest = Forest::new();
        forest.reduction = match fields[0].as_str() {
            "add" => ReductionType::Add,
            "voting" => ReductionType::Voting,
            other => {
                return Err(Diagnostic::error(
                    format!("unknown reduction '{}'", other),
                    span,
                ))
            }
        };
        forest.num_classes = parse_field(&fields[1], span)?;
        let num_features: usize = parse_field(&fields[2], span)?;
        let num_trees: usize = parse_field(&fields[3], span)?;

        for _ in 0..num_features {
            let (span, fields) = lines.expect("feature")?;
            if fields.len() != 2 {
                return Err(lines.malformed(span, "feature <name> <type>"));
            }
            forest.add_feature(fields[0].clone(), fields[1].clone());
        }
        for _ in 0..num_trees {
            forest.trees.push(Tree::read_from(&mut lines)?);
        }
        if let Some((span, keyword, _)) = lines.next_record() {
            return Err(Diagnostic::error(
                format!("unexpected '{}' record after the last tree", keyword),
                span,
            ));
        }
        Ok(forest)
    }

    /// Read and validate a forest from a text model file.
    pub fn load(path: &std::path::Path) -> Result<(Self, String), Diagnostic> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::fatal(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let forest = Self::deserialize(&source)?;
        forest.validate()?;
        Ok((forest, source))
    }

    /// BLAKE3 of the text form; equal forests share a fingerprint.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(self.serialize().as_bytes()).as_bytes()
    }

    pub fn print_to_string(&self) -> String {
        let mut out = format!(
            "Forest: {} trees, {} features, reduction {}, classes {}\n",
            self.trees.len(),
            self.features.len(),
            self.reduction,
            self.num_classes
        );
        for (i, tree) in self.trees.iter().enumerate() {
            out.push_str(&format!("  Tree {}: {}\n", i, tree.print_to_string()));
        }
        out
    }
}

/// Span of the first record of a text model, for diagnostics that refer
/// to the model as a whole.
pub fn header_span(source: &str) -> Span {
    let line = source.lines().next().unwrap_or("");
    Span::of_line(0, line)
}
