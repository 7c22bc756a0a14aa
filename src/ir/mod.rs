//! Procedure IR emitted by the representation lowering.
//!
//! SSA values, structured control flow, and explicit async tokens. Device
//! memory operations carry an optional produced token and a dependency
//! list; a blocking `wait` is the only join. Host variants emit the same
//! operations without tokens.
//!
//! Every type implements `Display`; the textual form is what the CLI
//! prints and what the snapshot tests pin.

pub mod builder;
pub mod deps;

use std::fmt;

use crate::diagnostic::Diagnostic;
use crate::model::ScalarType;

// ─── Values and types ─────────────────────────────────────────────

/// An SSA value, numbered per procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    Host,
    Device,
    /// Block-local scratch shared by the workers of one thread block.
    Shared,
}

/// Composite element of a model buffer: one tile's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileType {
    pub tile_size: u32,
    pub threshold: ScalarType,
    pub feature_index: ScalarType,
    pub tile_shape: ScalarType,
    /// Present for sparse packing only.
    pub child_index: Option<ScalarType>,
}

impl fmt::Display for TileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile<{}x{}, {}, {}",
            self.tile_size, self.threshold, self.feature_index, self.tile_shape
        )?;
        if let Some(child) = self.child_index {
            write!(f, ", {}", child)?;
        }
        write!(f, ">")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    Scalar(ScalarType),
    Tile(TileType),
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::Scalar(s) => write!(f, "{}", s),
            ElemType::Tile(t) => write!(f, "{}", t),
        }
    }
}

/// Dimension value marking a size known only at run time.
pub const DYNAMIC: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferType {
    pub shape: Vec<i64>,
    pub elem: ElemType,
    pub space: MemorySpace,
}

impl BufferType {
    pub fn new(shape: Vec<i64>, elem: ElemType, space: MemorySpace) -> Self {
        Self { shape, elem, space }
    }

    pub fn vector(len: usize, scalar: ScalarType, space: MemorySpace) -> Self {
        Self::new(vec![len as i64], ElemType::Scalar(scalar), space)
    }

    pub fn with_space(&self, space: MemorySpace) -> Self {
        Self {
            space,
            ..self.clone()
        }
    }

    /// Total element count, `None` when any dimension is dynamic.
    pub fn num_elements(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &d| (d >= 0).then(|| acc * d as usize))
    }

    pub fn tile_type(&self) -> Option<&TileType> {
        match &self.elem {
            ElemType::Tile(t) => Some(t),
            ElemType::Scalar(_) => None,
        }
    }
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer<")?;
        for d in &self.shape {
            if *d == DYNAMIC {
                write!(f, "?x")?;
            } else {
                write!(f, "{}x", d)?;
            }
        }
        write!(f, "{}", self.elem)?;
        match self.space {
            MemorySpace::Host => {}
            MemorySpace::Device => write!(f, ", device")?,
            MemorySpace::Shared => write!(f, ", shared")?,
        }
        write!(f, ">")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Scalar(ScalarType),
    Vector(u32, ScalarType),
    /// Async completion token.
    Token,
    Buffer(BufferType),
}

impl Type {
    pub fn as_buffer(&self) -> Option<&BufferType> {
        match self {
            Type::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(s) => write!(f, "{}", s),
            Type::Vector(w, s) => write!(f, "vector<{}x{}>", w, s),
            Type::Token => write!(f, "!token"),
            Type::Buffer(b) => write!(f, "{}", b),
        }
    }
}

// ─── Operations ───────────────────────────────────────────────────

/// One IR operation. Structured ops carry nested bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ── Constants and arithmetic ──
    ConstIndex { dst: Value, value: i64 },
    ConstInt { dst: Value, value: i64, ty: ScalarType },
    AddI { dst: Value, lhs: Value, rhs: Value },
    SubI { dst: Value, lhs: Value, rhs: Value },
    MulI { dst: Value, lhs: Value, rhs: Value },
    /// Signed `lhs < rhs`, producing an `i1`.
    CmpLt { dst: Value, lhs: Value, rhs: Value },

    // ── Control flow ──
    If {
        cond: Value,
        results: Vec<Value>,
        then_body: Vec<Op>,
        else_body: Vec<Op>,
    },
    For {
        iv: Value,
        lower: Value,
        upper: Value,
        step: Value,
        body: Vec<Op>,
    },
    Yield(Vec<Value>),
    Return(Vec<Value>),

    // ── Memory ──
    Alloc {
        dst: Value,
        ty: BufferType,
        token: Option<Value>,
        deps: Vec<Value>,
    },
    Dealloc {
        buffer: Value,
        token: Option<Value>,
        deps: Vec<Value>,
    },
    Memcpy {
        dst: Value,
        src: Value,
        token: Option<Value>,
        deps: Vec<Value>,
    },
    /// With a token: `wait async`, a fresh token joining `deps` without
    /// blocking. Without: block until every dependency completes.
    Wait {
        token: Option<Value>,
        deps: Vec<Value>,
    },
    GetGlobal { dst: Value, name: String, ty: BufferType },
    Load { dst: Value, buffer: Value, index: Value },
    /// `width` consecutive scalars starting at `index * width`.
    LoadVector { dst: Value, buffer: Value, index: Value, width: u32 },
    Store { value: Value, buffer: Value, index: Value },
    SubView {
        dst: Value,
        source: Value,
        offset: Value,
        length: Value,
    },

    // ── Tile primitives ──
    LoadTileThresholds { dst: Value, buffer: Value, index: Value },
    LoadTileFeatureIndices { dst: Value, buffer: Value, index: Value },
    InitTile {
        buffer: Value,
        index: Value,
        thresholds: Value,
        feature_indices: Value,
        tile_shape: Option<Value>,
        child_index: Option<Value>,
    },

    // ── Device structure ──
    /// Grid of `grid` blocks of `block` workers. `block_ids` and
    /// `thread_ids` are defined inside `body`.
    Launch {
        token: Option<Value>,
        deps: Vec<Value>,
        grid: [Value; 3],
        block: [Value; 3],
        block_ids: [Value; 3],
        thread_ids: [Value; 3],
        body: Vec<Op>,
    },
    /// Every worker of the block arrives before any proceeds.
    Barrier,

    // ── Diagnostics ──
    DebugPrint { label: String, values: Vec<Value> },
    Comment(String),
}

impl Op {
    /// The token this op produces, if it is an async op.
    pub fn async_token(&self) -> Option<Value> {
        match self {
            Op::Alloc { token, .. }
            | Op::Dealloc { token, .. }
            | Op::Memcpy { token, .. }
            | Op::Wait { token, .. }
            | Op::Launch { token, .. } => *token,
            _ => None,
        }
    }

    /// Dependency tokens of an async or blocking op.
    pub fn async_deps(&self) -> &[Value] {
        match self {
            Op::Alloc { deps, .. }
            | Op::Dealloc { deps, .. }
            | Op::Memcpy { deps, .. }
            | Op::Wait { deps, .. }
            | Op::Launch { deps, .. } => deps,
            _ => &[],
        }
    }

    /// Nested regions, in order.
    pub fn regions(&self) -> Vec<&[Op]> {
        match self {
            Op::If {
                then_body,
                else_body,
                ..
            } => vec![then_body, else_body],
            Op::For { body, .. } | Op::Launch { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }
}

fn list(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `("%t = ", " async [deps]")` for async ops, `("", " [deps]")` otherwise.
fn async_parts(token: &Option<Value>, deps: &[Value]) -> (String, String) {
    match token {
        Some(t) => (format!("{} = ", t), format!(" async [{}]", list(deps))),
        None if deps.is_empty() => (String::new(), String::new()),
        None => (String::new(), format!(" [{}]", list(deps))),
    }
}

fn fmt_ops(f: &mut fmt::Formatter<'_>, ops: &[Op], depth: usize) -> fmt::Result {
    for op in ops {
        fmt_op(f, op, depth)?;
    }
    Ok(())
}

fn fmt_op(f: &mut fmt::Formatter<'_>, op: &Op, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    match op {
        Op::ConstIndex { dst, value } => writeln!(f, "{}{} = const {} : index", pad, dst, value),
        Op::ConstInt { dst, value, ty } => writeln!(f, "{}{} = const {} : {}", pad, dst, value, ty),
        Op::AddI { dst, lhs, rhs } => writeln!(f, "{}{} = add {}, {}", pad, dst, lhs, rhs),
        Op::SubI { dst, lhs, rhs } => writeln!(f, "{}{} = sub {}, {}", pad, dst, lhs, rhs),
        Op::MulI { dst, lhs, rhs } => writeln!(f, "{}{} = mul {}, {}", pad, dst, lhs, rhs),
        Op::CmpLt { dst, lhs, rhs } => writeln!(f, "{}{} = cmp lt {}, {}", pad, dst, lhs, rhs),
        Op::If {
            cond,
            results,
            then_body,
            else_body,
        } => {
            if results.is_empty() {
                writeln!(f, "{}if {} {{", pad, cond)?;
            } else {
                writeln!(f, "{}{} = if {} {{", pad, list(results), cond)?;
            }
            fmt_ops(f, then_body, depth + 1)?;
            if !else_body.is_empty() {
                writeln!(f, "{}}} else {{", pad)?;
                fmt_ops(f, else_body, depth + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        Op::For {
            iv,
            lower,
            upper,
            step,
            body,
        } => {
            writeln!(f, "{}for {} = {} to {} step {} {{", pad, iv, lower, upper, step)?;
            fmt_ops(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Op::Yield(values) => writeln!(f, "{}yield {}", pad, list(values)),
        Op::Return(values) if values.is_empty() => writeln!(f, "{}return", pad),
        Op::Return(values) => writeln!(f, "{}return {}", pad, list(values)),
        Op::Alloc {
            dst,
            ty,
            token,
            deps,
        } => {
            let (_, tail) = async_parts(token, deps);
            match token {
                Some(t) => writeln!(f, "{}{}, {} = alloc{} : {}", pad, dst, t, tail, ty),
                None => writeln!(f, "{}{} = alloc{} : {}", pad, dst, tail, ty),
            }
        }
        Op::Dealloc {
            buffer,
            token,
            deps,
        } => {
            let (head, tail) = async_parts(token, deps);
            writeln!(f, "{}{}dealloc{} {}", pad, head, tail, buffer)
        }
        Op::Memcpy {
            dst,
            src,
            token,
            deps,
        } => {
            let (head, tail) = async_parts(token, deps);
            writeln!(f, "{}{}memcpy{} {}, {}", pad, head, tail, dst, src)
        }
        Op::Wait { token, deps } => {
            let (head, tail) = async_parts(token, deps);
            if token.is_none() {
                writeln!(f, "{}wait [{}]", pad, list(deps))
            } else {
                writeln!(f, "{}{}wait{}", pad, head, tail)
            }
        }
        Op::GetGlobal { dst, name, ty } => {
            writeln!(f, "{}{} = get_global @{} : {}", pad, dst, name, ty)
        }
        Op::Load { dst, buffer, index } => writeln!(f, "{}{} = load {}[{}]", pad, dst, buffer, index),
        Op::LoadVector {
            dst,
            buffer,
            index,
            width,
        } => writeln!(f, "{}{} = load_vector<{}> {}[{}]", pad, dst, width, buffer, index),
        Op::Store {
            value,
            buffer,
            index,
        } => writeln!(f, "{}store {}, {}[{}]", pad, value, buffer, index),
        Op::SubView {
            dst,
            source,
            offset,
            length,
        } => writeln!(f, "{}{} = subview {}[{}][{}]", pad, dst, source, offset, length),
        Op::LoadTileThresholds { dst, buffer, index } => {
            writeln!(f, "{}{} = load_tile_thresholds {}[{}]", pad, dst, buffer, index)
        }
        Op::LoadTileFeatureIndices { dst, buffer, index } => {
            writeln!(f, "{}{} = load_tile_feature_indices {}[{}]", pad, dst, buffer, index)
        }
        Op::InitTile {
            buffer,
            index,
            thresholds,
            feature_indices,
            tile_shape,
            child_index,
        } => {
            write!(
                f,
                "{}init_tile {}[{}], {}, {}",
                pad, buffer, index, thresholds, feature_indices
            )?;
            if let Some(s) = tile_shape {
                write!(f, ", shape {}", s)?;
            }
            if let Some(c) = child_index {
                write!(f, ", child {}", c)?;
            }
            writeln!(f)
        }
        Op::Launch {
            token,
            deps,
            grid,
            block,
            block_ids,
            thread_ids,
            body,
        } => {
            let (head, tail) = async_parts(token, deps);
            writeln!(
                f,
                "{}{}launch{} blocks({}) in ({}) threads({}) in ({}) {{",
                pad,
                head,
                tail,
                list(block_ids),
                list(grid),
                list(thread_ids),
                list(block)
            )?;
            fmt_ops(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Op::Barrier => writeln!(f, "{}barrier", pad),
        Op::DebugPrint { label, values } => {
            writeln!(f, "{}debug_print \"{}\" {}", pad, label, list(values))
        }
        Op::Comment(text) => writeln!(f, "{}// {}", pad, text),
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_op(f, self, 0)
    }
}

// ─── Procedures and modules ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub public: bool,
    pub params: Vec<(Value, Type)>,
    pub results: Vec<Type>,
    pub body: Vec<Op>,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|(v, t)| format!("{}: {}", v, t))
            .collect::<Vec<_>>()
            .join(", ");
        let visibility = if self.public { "public" } else { "private" };
        write!(f, "func {} @{}({})", visibility, self.name, params)?;
        if !self.results.is_empty() {
            let results = self
                .results
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " -> ({})", results)?;
        }
        writeln!(f, " {{")?;
        fmt_ops(f, &self.body, 1)?;
        write!(f, "}}")
    }
}

/// Module-level buffer; used for block-shared scratch.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: BufferType,
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global @{} : {}", self.name, self.ty)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub globals: Vec<Global>,
    pub procedures: Vec<Procedure>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_free(&self, name: &str) -> Result<(), Diagnostic> {
        let taken = self.globals.iter().any(|g| g.name == name)
            || self.procedures.iter().any(|p| p.name == name);
        if taken {
            return Err(Diagnostic::fatal(format!(
                "symbol '@{}' is already defined in the module",
                name
            )));
        }
        Ok(())
    }

    pub fn add_procedure(&mut self, procedure: Procedure) -> Result<(), Diagnostic> {
        self.check_free(&procedure.name)?;
        self.procedures.push(procedure);
        Ok(())
    }

    pub fn add_global(&mut self, global: Global) -> Result<(), Diagnostic> {
        self.check_free(&global.name)?;
        self.globals.push(global);
        Ok(())
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for global in &self.globals {
            writeln!(f, "{}", global)?;
        }
        for (i, procedure) in self.procedures.iter().enumerate() {
            if i > 0 || !self.globals.is_empty() {
                writeln!(f)?;
            }
            writeln!(f, "{}", procedure)?;
        }
        Ok(())
    }
}
