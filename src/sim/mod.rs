//! Reference interpreter for lowered modules.
//!
//! Runs procedures on host memory so the emitted buffer routines can be
//! checked end to end without a device. Async ops complete eagerly, but
//! a buffer they produce stays pending until its token is joined by a
//! blocking `wait` or is an ancestor of the consuming op's dependencies.
//! Reading a pending buffer, returning with unjoined tokens, freeing a
//! buffer twice and indexing out of range are all errors.
//!
//! `launch` runs the blocks one after another; the workers of a block run
//! on scoped threads sharing a `std::sync::Barrier` and a fresh set of
//! block-shared globals.

use std::collections::{HashMap, HashSet};
use std::sync::{Barrier, Mutex, MutexGuard};

use crate::diagnostic::Diagnostic;
use crate::ir::{ElemType, MemorySpace, Module, Op, Value};

#[cfg(test)]
mod tests;

// ─── Memory ───────────────────────────────────────────────────────

/// One element of a tiled model buffer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileData {
    pub thresholds: Vec<f64>,
    pub feature_indices: Vec<i64>,
    pub tile_shape: i64,
    pub child_index: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Elem {
    Int(i64),
    Float(f64),
    Tile(TileData),
}

impl Elem {
    fn zero(elem: &ElemType) -> Self {
        match elem {
            ElemType::Scalar(s) if s.is_float() => Elem::Float(0.0),
            ElemType::Scalar(_) => Elem::Int(0),
            ElemType::Tile(t) => Elem::Tile(TileData {
                thresholds: vec![0.0; t.tile_size as usize],
                feature_indices: vec![0; t.tile_size as usize],
                tile_shape: 0,
                child_index: 0,
            }),
        }
    }

    pub fn as_tile(&self) -> Option<&TileData> {
        match self {
            Elem::Tile(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Elem::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Elem::Int(x) => Some(*x),
            _ => None,
        }
    }
}

/// A window `[offset, offset + len)` of one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferView {
    id: usize,
    offset: usize,
    len: usize,
}

impl BufferView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Int(i64),
    Float(f64),
    Vector(Vec<Val>),
    Token(usize),
    Buffer(BufferView),
}

impl Val {
    pub fn as_int(&self) -> Result<i64, Diagnostic> {
        match self {
            Val::Int(x) => Ok(*x),
            other => Err(fault(format!("expected an integer, got {:?}", other))),
        }
    }

    pub fn as_buffer(&self) -> Result<BufferView, Diagnostic> {
        match self {
            Val::Buffer(b) => Ok(*b),
            other => Err(fault(format!("expected a buffer, got {:?}", other))),
        }
    }

    fn as_token(&self) -> Result<usize, Diagnostic> {
        match self {
            Val::Token(t) => Ok(*t),
            other => Err(fault(format!("expected a token, got {:?}", other))),
        }
    }

    fn to_elem(&self) -> Result<Elem, Diagnostic> {
        match self {
            Val::Int(x) => Ok(Elem::Int(*x)),
            Val::Float(x) => Ok(Elem::Float(*x)),
            other => Err(fault(format!("cannot store {:?}", other))),
        }
    }

    fn from_elem(elem: &Elem) -> Result<Val, Diagnostic> {
        match elem {
            Elem::Int(x) => Ok(Val::Int(*x)),
            Elem::Float(x) => Ok(Val::Float(*x)),
            Elem::Tile(_) => Err(fault("scalar load from a tile buffer")),
        }
    }

    /// Lanes of a scalar or vector value.
    fn lanes(&self) -> Vec<Val> {
        match self {
            Val::Vector(lanes) => lanes.clone(),
            other => vec![other.clone()],
        }
    }

    fn pack(lanes: Vec<Val>) -> Val {
        if lanes.len() == 1 {
            lanes.into_iter().next().unwrap_or(Val::Int(0))
        } else {
            Val::Vector(lanes)
        }
    }
}

fn fault(message: impl Into<String>) -> Diagnostic {
    Diagnostic::fatal(format!("simulation: {}", message.into()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Allocation {
    elems: Vec<Elem>,
    space: MemorySpace,
    /// Token of the last async op that wrote the buffer.
    pending: Option<usize>,
    freed: bool,
}

struct TokenState {
    deps: Vec<usize>,
    joined: bool,
}

// ─── Execution state ──────────────────────────────────────────────

struct BlockContext {
    shared: Mutex<HashMap<String, BufferView>>,
    barrier: Barrier,
    barriers: usize,
}

struct Frame<'b> {
    values: HashMap<Value, Val>,
    /// Tokens whose effects this frame may observe without a join.
    visible: HashSet<usize>,
    /// Token of the launch this frame runs in; writes are attributed to it.
    producing: Option<usize>,
    block: Option<&'b BlockContext>,
    barriers_passed: usize,
}

impl Frame<'_> {
    fn get(&self, value: Value) -> Result<&Val, Diagnostic> {
        self.values
            .get(&value)
            .ok_or_else(|| fault(format!("{} is used before it is defined", value)))
    }

    fn set(&mut self, value: Value, val: Val) {
        self.values.insert(value, val);
    }

    fn int(&self, value: Value) -> Result<i64, Diagnostic> {
        self.get(value)?.as_int()
    }

    fn buffer(&self, value: Value) -> Result<BufferView, Diagnostic> {
        self.get(value)?.as_buffer()
    }

    fn all(&self, values: &[Value]) -> Result<Vec<Val>, Diagnostic> {
        values.iter().map(|&v| self.get(v).cloned()).collect()
    }

    fn tokens(&self, deps: &[Value]) -> Result<Vec<usize>, Diagnostic> {
        deps.iter().map(|&d| self.get(d)?.as_token()).collect()
    }
}

enum Flow {
    Next,
    Yield(Vec<Val>),
    Return(Vec<Val>),
}

fn count_barriers(ops: &[Op]) -> usize {
    ops.iter()
        .map(|op| {
            usize::from(matches!(op, Op::Barrier))
                + op.regions().iter().map(|r| count_barriers(r)).sum::<usize>()
        })
        .sum()
}

// ─── Machine ──────────────────────────────────────────────────────

pub struct Machine<'m> {
    module: &'m Module,
    heap: Mutex<Vec<Allocation>>,
    tokens: Mutex<Vec<TokenState>>,
    globals: Mutex<HashMap<String, BufferView>>,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            heap: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            globals: Mutex::new(HashMap::new()),
        }
    }

    // ── Host interface ──

    pub fn host_buffer(&self, elems: Vec<Elem>) -> Val {
        let len = elems.len();
        let id = self.allocate(elems, MemorySpace::Host, None);
        Val::Buffer(BufferView { id, offset: 0, len })
    }

    pub fn host_floats(&self, data: &[f64]) -> Val {
        self.host_buffer(data.iter().map(|&x| Elem::Float(x)).collect())
    }

    pub fn host_ints<T: Copy + Into<i64>>(&self, data: &[T]) -> Val {
        self.host_buffer(data.iter().map(|&x| Elem::Int(x.into())).collect())
    }

    /// Contents of a live buffer, ignoring pending state.
    pub fn read(&self, value: &Val) -> Result<Vec<Elem>, Diagnostic> {
        let view = value.as_buffer()?;
        let heap = lock(&self.heap);
        let alloc = live(&heap, view)?;
        Ok(alloc.elems[view.offset..view.offset + view.len].to_vec())
    }

    pub fn space(&self, value: &Val) -> Result<MemorySpace, Diagnostic> {
        let view = value.as_buffer()?;
        let heap = lock(&self.heap);
        Ok(heap
            .get(view.id)
            .ok_or_else(|| fault("unknown buffer"))?
            .space)
    }

    pub fn is_freed(&self, value: &Val) -> bool {
        match value {
            Val::Buffer(view) => lock(&self.heap).get(view.id).map_or(false, |a| a.freed),
            _ => false,
        }
    }

    /// Buffers that are still allocated.
    pub fn live_buffers(&self) -> usize {
        lock(&self.heap).iter().filter(|a| !a.freed).count()
    }

    /// Run procedure `name`; every token it creates must be joined before
    /// it returns.
    pub fn call(&self, name: &str, args: Vec<Val>) -> Result<Vec<Val>, Diagnostic> {
        let procedure = self
            .module
            .procedure(name)
            .ok_or_else(|| fault(format!("no procedure @{}", name)))?;
        if args.len() != procedure.params.len() {
            return Err(fault(format!(
                "@{} takes {} arguments, got {}",
                name,
                procedure.params.len(),
                args.len()
            )));
        }
        let first_token = lock(&self.tokens).len();
        let mut frame = Frame {
            values: procedure.params.iter().map(|(v, _)| *v).zip(args).collect(),
            visible: HashSet::new(),
            producing: None,
            block: None,
            barriers_passed: 0,
        };
        let results = match self.run(&procedure.body, &mut frame)? {
            Flow::Return(values) => values,
            _ => return Err(fault(format!("@{} ends without a return", name))),
        };
        let tokens = lock(&self.tokens);
        let open: Vec<String> = (first_token..tokens.len())
            .filter(|&t| !tokens[t].joined)
            .map(|t| format!("#{}", t))
            .collect();
        if !open.is_empty() {
            return Err(fault(format!(
                "@{} returned with unjoined async tokens {}",
                name,
                open.join(", ")
            )));
        }
        Ok(results)
    }

    // ── Bookkeeping ──

    fn allocate(&self, elems: Vec<Elem>, space: MemorySpace, pending: Option<usize>) -> usize {
        let mut heap = lock(&self.heap);
        heap.push(Allocation {
            elems,
            space,
            pending,
            freed: false,
        });
        heap.len() - 1
    }

    /// Register the token an async op produces, if it produces one.
    fn produce(
        &self,
        frame: &mut Frame<'_>,
        token: &Option<Value>,
        deps: &[Value],
    ) -> Result<Option<usize>, Diagnostic> {
        let Some(token) = token else {
            return Ok(None);
        };
        let deps = frame.tokens(deps)?;
        let mut tokens = lock(&self.tokens);
        tokens.push(TokenState {
            deps,
            joined: false,
        });
        let id = tokens.len() - 1;
        frame.set(*token, Val::Token(id));
        Ok(Some(id))
    }

    fn ancestors(&self, roots: &[usize]) -> HashSet<usize> {
        let tokens = lock(&self.tokens);
        let mut seen = HashSet::new();
        let mut stack = roots.to_vec();
        while let Some(t) = stack.pop() {
            if seen.insert(t) {
                if let Some(state) = tokens.get(t) {
                    stack.extend(&state.deps);
                }
            }
        }
        seen
    }

    /// What an op depending on `deps` may observe.
    fn visible_for(&self, frame: &Frame<'_>, deps: &[Value]) -> Result<HashSet<usize>, Diagnostic> {
        let mut visible = frame.visible.clone();
        visible.extend(self.ancestors(&frame.tokens(deps)?));
        Ok(visible)
    }

    fn ready(&self, heap: &[Allocation], view: BufferView, visible: &HashSet<usize>) -> Result<(), Diagnostic> {
        let alloc = live(heap, view)?;
        if let Some(p) = alloc.pending {
            let joined = lock(&self.tokens).get(p).map_or(false, |t| t.joined);
            if !joined && !visible.contains(&p) {
                return Err(fault(format!(
                    "buffer #{} is used before the async op writing it (token #{}) is waited on",
                    view.id, p
                )));
            }
        }
        Ok(())
    }

    fn read_range(
        &self,
        frame: &Frame<'_>,
        buffer: Value,
        start: i64,
        count: usize,
    ) -> Result<Vec<Elem>, Diagnostic> {
        let view = frame.buffer(buffer)?;
        let heap = lock(&self.heap);
        self.ready(&heap, view, &frame.visible)?;
        let range = bounds(view, start, count)?;
        Ok(heap[view.id].elems[range].to_vec())
    }

    fn write_at(
        &self,
        frame: &Frame<'_>,
        buffer: Value,
        index: i64,
        write: impl FnOnce(&mut Elem) -> Result<(), Diagnostic>,
    ) -> Result<(), Diagnostic> {
        let view = frame.buffer(buffer)?;
        let mut heap = lock(&self.heap);
        self.ready(&heap, view, &frame.visible)?;
        let range = bounds(view, index, 1)?;
        let alloc = &mut heap[view.id];
        write(&mut alloc.elems[range.start])?;
        if frame.producing.is_some() {
            alloc.pending = frame.producing;
        }
        Ok(())
    }

    // ── Interpreter ──

    fn run(&self, ops: &[Op], frame: &mut Frame<'_>) -> Result<Flow, Diagnostic> {
        for op in ops {
            match self.step(op, frame)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn step(&self, op: &Op, frame: &mut Frame<'_>) -> Result<Flow, Diagnostic> {
        match op {
            Op::ConstIndex { dst, value } | Op::ConstInt { dst, value, .. } => {
                frame.set(*dst, Val::Int(*value));
            }
            Op::AddI { dst, lhs, rhs } => {
                let v = frame.int(*lhs)?.wrapping_add(frame.int(*rhs)?);
                frame.set(*dst, Val::Int(v));
            }
            Op::SubI { dst, lhs, rhs } => {
                let v = frame.int(*lhs)?.wrapping_sub(frame.int(*rhs)?);
                frame.set(*dst, Val::Int(v));
            }
            Op::MulI { dst, lhs, rhs } => {
                let v = frame.int(*lhs)?.wrapping_mul(frame.int(*rhs)?);
                frame.set(*dst, Val::Int(v));
            }
            Op::CmpLt { dst, lhs, rhs } => {
                let v = frame.int(*lhs)? < frame.int(*rhs)?;
                frame.set(*dst, Val::Int(i64::from(v)));
            }

            // ── Control flow ──
            Op::If {
                cond,
                results,
                then_body,
                else_body,
            } => {
                let body = if frame.int(*cond)? != 0 {
                    then_body
                } else {
                    else_body
                };
                match self.run(body, frame)? {
                    Flow::Yield(values) if values.len() == results.len() => {
                        for (r, v) in results.iter().zip(values) {
                            frame.set(*r, v);
                        }
                    }
                    Flow::Next if results.is_empty() => {}
                    Flow::Return(values) => return Ok(Flow::Return(values)),
                    _ => {
                        return Err(fault(format!(
                            "if arm does not yield its {} results",
                            results.len()
                        )))
                    }
                }
            }
            Op::For {
                iv,
                lower,
                upper,
                step,
                body,
            } => {
                let (lo, hi, st) = (frame.int(*lower)?, frame.int(*upper)?, frame.int(*step)?);
                if st <= 0 {
                    return Err(fault(format!("for loop with step {}", st)));
                }
                let mut i = lo;
                while i < hi {
                    frame.set(*iv, Val::Int(i));
                    if let Flow::Return(values) = self.run(body, frame)? {
                        return Ok(Flow::Return(values));
                    }
                    i += st;
                }
            }
            Op::Yield(values) => return Ok(Flow::Yield(frame.all(values)?)),
            Op::Return(values) => return Ok(Flow::Return(frame.all(values)?)),

            // ── Memory ──
            Op::Alloc {
                dst,
                ty,
                token,
                deps,
            } => {
                let len = ty
                    .num_elements()
                    .ok_or_else(|| fault(format!("alloc of dynamically sized {}", ty)))?;
                let produced = self.produce(frame, token, deps)?;
                let id = self.allocate(vec![Elem::zero(&ty.elem); len], ty.space, produced);
                frame.set(*dst, Val::Buffer(BufferView { id, offset: 0, len }));
            }
            Op::Dealloc {
                buffer,
                token,
                deps,
            } => {
                let view = frame.buffer(*buffer)?;
                let visible = self.visible_for(frame, deps)?;
                {
                    let mut heap = lock(&self.heap);
                    if heap.get(view.id).map_or(false, |a| a.freed) {
                        return Err(fault(format!("buffer #{} freed twice", view.id)));
                    }
                    self.ready(&heap, view, &visible)?;
                    heap[view.id].freed = true;
                }
                self.produce(frame, token, deps)?;
            }
            Op::Memcpy {
                dst,
                src,
                token,
                deps,
            } => {
                let (to, from) = (frame.buffer(*dst)?, frame.buffer(*src)?);
                let visible = self.visible_for(frame, deps)?;
                let produced = self.produce(frame, token, deps)?;
                let mut heap = lock(&self.heap);
                self.ready(&heap, from, &visible)?;
                live(&heap, to)?;
                if to.len != from.len {
                    return Err(fault(format!(
                        "memcpy of {} elements into a buffer of {}",
                        from.len, to.len
                    )));
                }
                let data = heap[from.id].elems[from.offset..from.offset + from.len].to_vec();
                let target = &mut heap[to.id];
                target.elems[to.offset..to.offset + to.len].clone_from_slice(&data);
                if produced.is_some() {
                    target.pending = produced;
                }
            }
            Op::Wait { token: None, deps } => {
                let joined = self.ancestors(&frame.tokens(deps)?);
                let mut tokens = lock(&self.tokens);
                for t in joined {
                    tokens[t].joined = true;
                }
            }
            Op::Wait { token, deps } => {
                self.produce(frame, token, deps)?;
            }
            Op::GetGlobal { dst, name, ty } => {
                let registry = match ty.space {
                    MemorySpace::Shared => {
                        &frame
                            .block
                            .ok_or_else(|| {
                                fault(format!("block-shared @{} used outside a launch", name))
                            })?
                            .shared
                    }
                    _ => &self.globals,
                };
                let view = {
                    let mut known = lock(registry);
                    match known.get(name) {
                        Some(view) => *view,
                        None => {
                            let len = ty.num_elements().ok_or_else(|| {
                                fault(format!("global @{} has no static size", name))
                            })?;
                            let id = self.allocate(vec![Elem::zero(&ty.elem); len], ty.space, None);
                            let view = BufferView { id, offset: 0, len };
                            known.insert(name.clone(), view);
                            view
                        }
                    }
                };
                frame.set(*dst, Val::Buffer(view));
            }
            Op::Load { dst, buffer, index } => {
                let elems = self.read_range(frame, *buffer, frame.int(*index)?, 1)?;
                frame.set(*dst, Val::from_elem(&elems[0])?);
            }
            Op::LoadVector {
                dst,
                buffer,
                index,
                width,
            } => {
                let width = *width as usize;
                let start = frame.int(*index)? * width as i64;
                let lanes = self
                    .read_range(frame, *buffer, start, width)?
                    .iter()
                    .map(Val::from_elem)
                    .collect::<Result<Vec<_>, _>>()?;
                frame.set(*dst, Val::Vector(lanes));
            }
            Op::Store {
                value,
                buffer,
                index,
            } => {
                let elem = frame.get(*value)?.to_elem()?;
                self.write_at(frame, *buffer, frame.int(*index)?, |slot| {
                    *slot = elem;
                    Ok(())
                })?;
            }
            Op::SubView {
                dst,
                source,
                offset,
                length,
            } => {
                let view = frame.buffer(*source)?;
                let (off, len) = (frame.int(*offset)?, frame.int(*length)?);
                if len < 0 {
                    return Err(fault(format!("subview of negative length {}", len)));
                }
                let range = bounds(view, off, len as usize)?;
                frame.set(
                    *dst,
                    Val::Buffer(BufferView {
                        id: view.id,
                        offset: range.start,
                        len: range.len(),
                    }),
                );
            }

            // ── Tile primitives ──
            Op::LoadTileThresholds { dst, buffer, index } => {
                let tile = self.tile(frame, *buffer, *index)?;
                frame.set(*dst, Val::pack(tile.thresholds.iter().map(|&x| Val::Float(x)).collect()));
            }
            Op::LoadTileFeatureIndices { dst, buffer, index } => {
                let tile = self.tile(frame, *buffer, *index)?;
                frame.set(*dst, Val::pack(tile.feature_indices.iter().map(|&x| Val::Int(x)).collect()));
            }
            Op::InitTile {
                buffer,
                index,
                thresholds,
                feature_indices,
                tile_shape,
                child_index,
            } => {
                let thresholds = frame
                    .get(*thresholds)?
                    .lanes()
                    .iter()
                    .map(|v| match v {
                        Val::Float(x) => Ok(*x),
                        other => Err(fault(format!("threshold lane {:?}", other))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let features = frame
                    .get(*feature_indices)?
                    .lanes()
                    .iter()
                    .map(Val::as_int)
                    .collect::<Result<Vec<_>, _>>()?;
                let shape = tile_shape.map(|s| frame.int(s)).transpose()?;
                let child = child_index.map(|c| frame.int(c)).transpose()?;
                self.write_at(frame, *buffer, frame.int(*index)?, |slot| match slot {
                    Elem::Tile(tile)
                        if tile.thresholds.len() == thresholds.len()
                            && tile.feature_indices.len() == features.len() =>
                    {
                        tile.thresholds = thresholds;
                        tile.feature_indices = features;
                        if let Some(s) = shape {
                            tile.tile_shape = s;
                        }
                        if let Some(c) = child {
                            tile.child_index = c;
                        }
                        Ok(())
                    }
                    _ => Err(fault("init_tile into a slot of a different shape")),
                })?;
            }

            // ── Device structure ──
            Op::Launch {
                token,
                deps,
                grid,
                block,
                block_ids,
                thread_ids,
                body,
            } => self.launch(frame, token, deps, grid, block, block_ids, thread_ids, body)?,
            Op::Barrier => {
                let block = frame
                    .block
                    .ok_or_else(|| fault("barrier outside a launch"))?;
                block.barrier.wait();
                frame.barriers_passed += 1;
            }

            Op::DebugPrint { label, values } => {
                log::debug!("{}: {:?}", label, frame.all(values)?);
            }
            Op::Comment(_) => {}
        }
        Ok(Flow::Next)
    }

    fn tile(&self, frame: &Frame<'_>, buffer: Value, index: Value) -> Result<TileData, Diagnostic> {
        let elems = self.read_range(frame, buffer, frame.int(index)?, 1)?;
        elems[0]
            .as_tile()
            .cloned()
            .ok_or_else(|| fault("tile load from a scalar buffer"))
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        frame: &mut Frame<'_>,
        token: &Option<Value>,
        deps: &[Value],
        grid: &[Value; 3],
        block: &[Value; 3],
        block_ids: &[Value; 3],
        thread_ids: &[Value; 3],
        body: &[Op],
    ) -> Result<(), Diagnostic> {
        let dims = |values: &[Value; 3]| -> Result<[i64; 3], Diagnostic> {
            let mut out = [0; 3];
            for (o, v) in out.iter_mut().zip(values) {
                *o = frame.int(*v)?;
                if *o < 1 {
                    return Err(fault(format!("launch dimension {}", o)));
                }
            }
            Ok(out)
        };
        let (g, b) = (dims(grid)?, dims(block)?);
        let mut visible = self.visible_for(frame, deps)?;
        let produced = self.produce(frame, token, deps)?;
        visible.extend(produced);
        let workers = (b[0] * b[1] * b[2]) as usize;
        let barriers = count_barriers(body);

        for bid in 0..g[0] * g[1] * g[2] {
            let block_id = [bid % g[0], (bid / g[0]) % g[1], bid / (g[0] * g[1])];
            let context = BlockContext {
                shared: Mutex::new(HashMap::new()),
                barrier: Barrier::new(workers),
                barriers,
            };
            let failures: Vec<Diagnostic> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..workers as i64)
                    .map(|w| {
                        let tid = [w % b[0], (w / b[0]) % b[1], w / (b[0] * b[1])];
                        let mut worker = Frame {
                            values: frame.values.clone(),
                            visible: visible.clone(),
                            producing: produced,
                            block: Some(&context),
                            barriers_passed: 0,
                        };
                        for k in 0..3 {
                            worker.set(block_ids[k], Val::Int(block_id[k]));
                            worker.set(thread_ids[k], Val::Int(tid[k]));
                        }
                        let context = &context;
                        scope.spawn(move || {
                            let outcome = match self.run(body, &mut worker) {
                                Ok(Flow::Next) => Ok(()),
                                Ok(_) => Err(fault("launch body yields or returns")),
                                Err(e) => Err(e),
                            };
                            // Keep the rest of the block from waiting on us.
                            if outcome.is_err() {
                                for _ in worker.barriers_passed..context.barriers {
                                    context.barrier.wait();
                                }
                            }
                            outcome
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .filter_map(|h| match h.join() {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(_) => Some(fault("launch worker panicked")),
                    })
                    .collect()
            });

            let shared = context.shared.into_inner().unwrap_or_else(|p| p.into_inner());
            let mut heap = lock(&self.heap);
            for view in shared.values() {
                heap[view.id].freed = true;
            }
            drop(heap);
            if let Some(first) = failures.into_iter().next() {
                return Err(first);
            }
        }
        Ok(())
    }
}

fn live(heap: &[Allocation], view: BufferView) -> Result<&Allocation, Diagnostic> {
    let alloc = heap
        .get(view.id)
        .ok_or_else(|| fault(format!("unknown buffer #{}", view.id)))?;
    if alloc.freed {
        return Err(fault(format!("buffer #{} used after it was freed", view.id)));
    }
    Ok(alloc)
}

fn bounds(view: BufferView, start: i64, count: usize) -> Result<std::ops::Range<usize>, Diagnostic> {
    if start < 0 || start as usize + count > view.len {
        return Err(fault(format!(
            "index {} (+{}) out of range for a buffer of {} elements",
            start, count, view.len
        )));
    }
    let first = view.offset + start as usize;
    Ok(first..first + count)
}
