//! FnBuilder: emits one `Procedure` with fresh SSA values.
//!
//! Structured ops (`if`, `for`, `launch`) take closures that emit into a
//! nested body; the builder swaps its op list out while the closure runs
//! and wraps whatever it emitted into the structured op afterwards.

use std::collections::HashMap;

use super::{BufferType, ElemType, Op, Procedure, Type, Value, DYNAMIC};
use crate::model::ScalarType;

/// Values a `launch` body sees: per-worker ids and the launch dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchIds {
    pub block_ids: [Value; 3],
    pub thread_ids: [Value; 3],
    pub grid: [Value; 3],
    pub block: [Value; 3],
}

pub struct FnBuilder {
    name: String,
    public: bool,
    params: Vec<(Value, Type)>,
    results: Vec<Type>,
    ops: Vec<Op>,
    types: HashMap<Value, Type>,
    next_value: u32,
}

impl FnBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: true,
            params: Vec::new(),
            results: Vec::new(),
            ops: Vec::new(),
            types: HashMap::new(),
            next_value: 0,
        }
    }

    pub fn with_results(mut self, results: Vec<Type>) -> Self {
        self.results = results;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Values ────────────────────────────────────────────────────

    fn fresh(&mut self, ty: Type) -> Value {
        let v = Value(self.next_value);
        self.next_value += 1;
        self.types.insert(v, ty);
        v
    }

    /// Append a parameter; its index is `params().len() - 1` afterwards.
    pub fn add_param(&mut self, ty: Type) -> Value {
        let v = self.fresh(ty.clone());
        self.params.push((v, ty));
        v
    }

    pub fn params(&self) -> &[(Value, Type)] {
        &self.params
    }

    pub fn type_of(&self, value: Value) -> Option<&Type> {
        self.types.get(&value)
    }

    pub fn buffer_type(&self, value: Value) -> Option<&BufferType> {
        self.type_of(value).and_then(Type::as_buffer)
    }

    fn scalar_elem(&self, buffer: Value) -> ScalarType {
        match self.buffer_type(buffer).map(|b| &b.elem) {
            Some(ElemType::Scalar(s)) => *s,
            _ => ScalarType::Index,
        }
    }

    fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn region<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> (Vec<Op>, R) {
        let saved = std::mem::take(&mut self.ops);
        let result = f(self);
        let body = std::mem::replace(&mut self.ops, saved);
        (body, result)
    }

    // ── Constants and arithmetic ──────────────────────────────────

    pub fn const_index(&mut self, value: i64) -> Value {
        let dst = self.fresh(Type::Scalar(ScalarType::Index));
        self.emit(Op::ConstIndex { dst, value });
        dst
    }

    pub fn const_int(&mut self, value: i64, ty: ScalarType) -> Value {
        let dst = self.fresh(Type::Scalar(ty));
        self.emit(Op::ConstInt { dst, value, ty });
        dst
    }

    fn arith_type(&self, lhs: Value) -> Type {
        self.type_of(lhs)
            .cloned()
            .unwrap_or(Type::Scalar(ScalarType::Index))
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        let dst = self.fresh(self.arith_type(lhs));
        self.emit(Op::AddI { dst, lhs, rhs });
        dst
    }

    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        let dst = self.fresh(self.arith_type(lhs));
        self.emit(Op::SubI { dst, lhs, rhs });
        dst
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        let dst = self.fresh(self.arith_type(lhs));
        self.emit(Op::MulI { dst, lhs, rhs });
        dst
    }

    pub fn cmp_lt(&mut self, lhs: Value, rhs: Value) -> Value {
        let dst = self.fresh(Type::Scalar(ScalarType::I1));
        self.emit(Op::CmpLt { dst, lhs, rhs });
        dst
    }

    // ── Control flow ──────────────────────────────────────────────

    pub fn if_then<R>(&mut self, cond: Value, then: impl FnOnce(&mut Self) -> R) -> R {
        let (then_body, result) = self.region(then);
        self.emit(Op::If {
            cond,
            results: Vec::new(),
            then_body,
            else_body: Vec::new(),
        });
        result
    }

    /// Two-armed `if` yielding one value of type `ty` from each arm.
    pub fn if_else_value(
        &mut self,
        cond: Value,
        ty: Type,
        then: impl FnOnce(&mut Self) -> Value,
        otherwise: impl FnOnce(&mut Self) -> Value,
    ) -> Value {
        let (mut then_body, a) = self.region(then);
        then_body.push(Op::Yield(vec![a]));
        let (mut else_body, b) = self.region(otherwise);
        else_body.push(Op::Yield(vec![b]));
        let result = self.fresh(ty);
        self.emit(Op::If {
            cond,
            results: vec![result],
            then_body,
            else_body,
        });
        result
    }

    pub fn for_loop<R>(
        &mut self,
        lower: Value,
        upper: Value,
        step: Value,
        body: impl FnOnce(&mut Self, Value) -> R,
    ) -> R {
        let iv = self.fresh(Type::Scalar(ScalarType::Index));
        let (ops, result) = self.region(|b| body(b, iv));
        self.emit(Op::For {
            iv,
            lower,
            upper,
            step,
            body: ops,
        });
        result
    }

    pub fn ret(&mut self, values: Vec<Value>) {
        self.emit(Op::Return(values));
    }

    // ── Memory ────────────────────────────────────────────────────

    pub fn alloc(&mut self, ty: BufferType) -> Value {
        let dst = self.fresh(Type::Buffer(ty.clone()));
        self.emit(Op::Alloc {
            dst,
            ty,
            token: None,
            deps: Vec::new(),
        });
        dst
    }

    /// Returns `(buffer, token)`.
    pub fn alloc_async(&mut self, ty: BufferType, deps: Vec<Value>) -> (Value, Value) {
        let dst = self.fresh(Type::Buffer(ty.clone()));
        let token = self.fresh(Type::Token);
        self.emit(Op::Alloc {
            dst,
            ty,
            token: Some(token),
            deps,
        });
        (dst, token)
    }

    pub fn dealloc(&mut self, buffer: Value) {
        self.emit(Op::Dealloc {
            buffer,
            token: None,
            deps: Vec::new(),
        });
    }

    pub fn dealloc_async(&mut self, buffer: Value, deps: Vec<Value>) -> Value {
        let token = self.fresh(Type::Token);
        self.emit(Op::Dealloc {
            buffer,
            token: Some(token),
            deps,
        });
        token
    }

    pub fn memcpy(&mut self, dst: Value, src: Value) {
        self.emit(Op::Memcpy {
            dst,
            src,
            token: None,
            deps: Vec::new(),
        });
    }

    pub fn memcpy_async(&mut self, dst: Value, src: Value, deps: Vec<Value>) -> Value {
        let token = self.fresh(Type::Token);
        self.emit(Op::Memcpy {
            dst,
            src,
            token: Some(token),
            deps,
        });
        token
    }

    /// Blocking join.
    pub fn wait(&mut self, deps: Vec<Value>) {
        self.emit(Op::Wait { token: None, deps });
    }

    /// Fresh token joining `deps`; starts a chain when `deps` is empty.
    pub fn wait_async(&mut self, deps: Vec<Value>) -> Value {
        let token = self.fresh(Type::Token);
        self.emit(Op::Wait {
            token: Some(token),
            deps,
        });
        token
    }

    pub fn get_global(&mut self, name: impl Into<String>, ty: BufferType) -> Value {
        let dst = self.fresh(Type::Buffer(ty.clone()));
        self.emit(Op::GetGlobal {
            dst,
            name: name.into(),
            ty,
        });
        dst
    }

    pub fn load(&mut self, buffer: Value, index: Value) -> Value {
        let dst = self.fresh(Type::Scalar(self.scalar_elem(buffer)));
        self.emit(Op::Load { dst, buffer, index });
        dst
    }

    /// Scalar load for width 1, vector load otherwise.
    pub fn load_field(&mut self, buffer: Value, index: Value, width: u32) -> Value {
        if width == 1 {
            return self.load(buffer, index);
        }
        let dst = self.fresh(Type::Vector(width, self.scalar_elem(buffer)));
        self.emit(Op::LoadVector {
            dst,
            buffer,
            index,
            width,
        });
        dst
    }

    pub fn store(&mut self, value: Value, buffer: Value, index: Value) {
        self.emit(Op::Store {
            value,
            buffer,
            index,
        });
    }

    /// Dynamic-length view of `length` elements of `source` from `offset`.
    pub fn subview(&mut self, source: Value, offset: Value, length: Value) -> Value {
        let ty = match self.buffer_type(source) {
            Some(b) => BufferType::new(vec![DYNAMIC], b.elem, b.space),
            None => BufferType::new(
                vec![DYNAMIC],
                ElemType::Scalar(ScalarType::Index),
                super::MemorySpace::Host,
            ),
        };
        let dst = self.fresh(Type::Buffer(ty));
        self.emit(Op::SubView {
            dst,
            source,
            offset,
            length,
        });
        dst
    }

    // ── Tile primitives ───────────────────────────────────────────

    fn tile_field_type(&self, buffer: Value, threshold: bool) -> Type {
        match self.buffer_type(buffer).and_then(BufferType::tile_type) {
            Some(t) => {
                let scalar = if threshold { t.threshold } else { t.feature_index };
                if t.tile_size == 1 {
                    Type::Scalar(scalar)
                } else {
                    Type::Vector(t.tile_size, scalar)
                }
            }
            None => Type::Scalar(ScalarType::Index),
        }
    }

    pub fn load_tile_thresholds(&mut self, buffer: Value, index: Value) -> Value {
        let dst = self.fresh(self.tile_field_type(buffer, true));
        self.emit(Op::LoadTileThresholds { dst, buffer, index });
        dst
    }

    pub fn load_tile_feature_indices(&mut self, buffer: Value, index: Value) -> Value {
        let dst = self.fresh(self.tile_field_type(buffer, false));
        self.emit(Op::LoadTileFeatureIndices { dst, buffer, index });
        dst
    }

    pub fn init_tile(
        &mut self,
        buffer: Value,
        index: Value,
        thresholds: Value,
        feature_indices: Value,
        tile_shape: Option<Value>,
        child_index: Option<Value>,
    ) {
        self.emit(Op::InitTile {
            buffer,
            index,
            thresholds,
            feature_indices,
            tile_shape,
            child_index,
        });
    }

    // ── Device structure ──────────────────────────────────────────

    /// Async launch of `grid` blocks of `block` workers; returns the
    /// completion token and whatever `body` returned.
    pub fn launch<R>(
        &mut self,
        deps: Vec<Value>,
        grid: [Value; 3],
        block: [Value; 3],
        body: impl FnOnce(&mut Self, &LaunchIds) -> R,
    ) -> (Value, R) {
        let index = Type::Scalar(ScalarType::Index);
        let block_ids = [(); 3].map(|_| self.fresh(index.clone()));
        let thread_ids = [(); 3].map(|_| self.fresh(index.clone()));
        let ids = LaunchIds {
            block_ids,
            thread_ids,
            grid,
            block,
        };
        let (ops, result) = self.region(|b| body(b, &ids));
        let token = self.fresh(Type::Token);
        self.emit(Op::Launch {
            token: Some(token),
            deps,
            grid,
            block,
            block_ids,
            thread_ids,
            body: ops,
        });
        (token, result)
    }

    pub fn barrier(&mut self) {
        self.emit(Op::Barrier);
    }

    pub fn debug_print(&mut self, label: impl Into<String>, values: Vec<Value>) {
        self.emit(Op::DebugPrint {
            label: label.into(),
            values,
        });
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.emit(Op::Comment(text.into()));
    }

    pub fn finish(self) -> Procedure {
        Procedure {
            name: self.name,
            public: self.public,
            params: self.params,
            results: self.results,
            body: self.ops,
        }
    }
}
