use super::*;
use crate::ir::builder::FnBuilder;
use crate::ir::{BufferType, Type};
use crate::lower::initializer::{make_cleanup, make_initializer};
use crate::lower::Target;
use crate::model::ScalarType;

fn offsets_ty() -> BufferType {
    BufferType::vector(3, ScalarType::Index, MemorySpace::Device)
}

/// Copy chain with the final blocking wait optionally left out.
fn copy_module(join: bool, read_back: bool) -> Module {
    let ty = offsets_ty();
    let mut b = FnBuilder::new("Copy");
    let input = b.add_param(Type::Buffer(ty.with_space(MemorySpace::Host)));
    let start = b.wait_async(vec![]);
    let (buf, allocated) = b.alloc_async(ty, vec![start]);
    let copied = b.memcpy_async(buf, input, vec![allocated]);
    if join {
        b.wait(vec![copied]);
    }
    if read_back {
        let zero = b.const_index(0);
        let first = b.load(buf, zero);
        b.ret(vec![first]);
    } else {
        b.ret(vec![buf]);
    }
    let mut module = Module::new();
    module.add_procedure(b.finish()).unwrap();
    module
}

#[test]
fn test_device_initializer_copies() {
    let mut module = Module::new();
    make_initializer(&mut module, "Init_Offsets", &offsets_ty(), Target::Device).unwrap();
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[0i64, 2, 5]);
    let out = machine.call("Init_Offsets", vec![input]).unwrap();
    assert_eq!(machine.space(&out[0]).unwrap(), MemorySpace::Device);
    let elems = machine.read(&out[0]).unwrap();
    assert_eq!(elems, vec![Elem::Int(0), Elem::Int(2), Elem::Int(5)]);
}

#[test]
fn test_joined_read_is_allowed() {
    let module = copy_module(true, true);
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[7i64, 8, 9]);
    assert_eq!(machine.call("Copy", vec![input]).unwrap(), vec![Val::Int(7)]);
}

#[test]
fn test_pending_read_is_reported() {
    let module = copy_module(false, true);
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[7i64, 8, 9]);
    let err = machine.call("Copy", vec![input]).unwrap_err();
    assert!(err.message.contains("waited on"));
}

#[test]
fn test_unjoined_return_is_reported() {
    let module = copy_module(false, false);
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[7i64, 8, 9]);
    let err = machine.call("Copy", vec![input]).unwrap_err();
    assert!(err.message.contains("unjoined async tokens"));
}

#[test]
fn test_cleanup_frees_and_double_free_fails() {
    let mut module = Module::new();
    make_initializer(&mut module, "Init_Offsets", &offsets_ty(), Target::Device).unwrap();
    make_cleanup(&mut module, "Dealloc_Buffers", &[offsets_ty()], Target::Device).unwrap();
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[0i64, 1, 2]);
    let buf = machine.call("Init_Offsets", vec![input]).unwrap().remove(0);
    let status = machine.call("Dealloc_Buffers", vec![buf.clone()]).unwrap();
    assert_eq!(status, vec![Val::Int(0)]);
    assert!(machine.is_freed(&buf));
    let err = machine.call("Dealloc_Buffers", vec![buf]).unwrap_err();
    assert!(err.message.contains("freed twice"));
}

#[test]
fn test_out_of_range_index() {
    let mut b = FnBuilder::new("Peek");
    let buf = b.add_param(Type::Buffer(BufferType::vector(2, ScalarType::F64, MemorySpace::Host)));
    let two = b.const_index(2);
    let v = b.load(buf, two);
    b.ret(vec![v]);
    let mut module = Module::new();
    module.add_procedure(b.finish()).unwrap();
    let machine = Machine::new(&module);
    let input = machine.host_floats(&[1.0, 2.0]);
    let err = machine.call("Peek", vec![input]).unwrap_err();
    assert!(err.message.contains("out of range"));
}

#[test]
fn test_launch_workers_share_block_memory() {
    // Each worker writes its id into shared memory; after the barrier it
    // reads its neighbour's slot into the output.
    let shared = BufferType::vector(4, ScalarType::Index, MemorySpace::Shared);
    let out_ty = BufferType::vector(8, ScalarType::Index, MemorySpace::Host);
    let mut b = FnBuilder::new("Rotate");
    let out = b.add_param(Type::Buffer(out_ty));
    let one = b.const_index(1);
    let two = b.const_index(2);
    let four = b.const_index(4);
    let start = b.wait_async(vec![]);
    let (done, ()) = b.launch(vec![start], [two, one, one], [four, one, one], |b, ids| {
        let scratch = b.get_global("slots", shared.clone());
        let t = ids.thread_ids[0];
        b.store(t, scratch, t);
        b.barrier();
        let next = b.add(t, one);
        let in_block = b.cmp_lt(next, four);
        let wrapped = b.if_else_value(
            in_block,
            Type::Scalar(ScalarType::Index),
            |_| next,
            |b| b.const_index(0),
        );
        let seen = b.load(scratch, wrapped);
        let base = b.mul(ids.block_ids[0], four);
        let slot = b.add(base, t);
        b.store(seen, out, slot);
    });
    b.wait(vec![done]);
    b.ret(vec![]);
    let mut module = Module::new();
    module
        .add_global(crate::ir::Global {
            name: "slots".to_string(),
            ty: shared.clone(),
        })
        .unwrap();
    module.add_procedure(b.finish()).unwrap();

    let machine = Machine::new(&module);
    let out = machine.host_ints(&[0i64; 8]);
    machine.call("Rotate", vec![out.clone()]).unwrap();
    let got: Vec<i64> = machine
        .read(&out)
        .unwrap()
        .iter()
        .filter_map(Elem::as_int)
        .collect();
    assert_eq!(got, vec![1, 2, 3, 0, 1, 2, 3, 0]);
}

#[test]
fn test_failing_worker_does_not_hang_block() {
    let mut b = FnBuilder::new("Broken");
    let buf = b.add_param(Type::Buffer(BufferType::vector(1, ScalarType::Index, MemorySpace::Host)));
    let one = b.const_index(1);
    let two = b.const_index(2);
    let start = b.wait_async(vec![]);
    let (done, ()) = b.launch(vec![start], [one, one, one], [two, one, one], |b, ids| {
        // Worker 1 indexes past the end before the barrier.
        b.store(ids.thread_ids[0], buf, ids.thread_ids[0]);
        b.barrier();
    });
    b.wait(vec![done]);
    b.ret(vec![]);
    let mut module = Module::new();
    module.add_procedure(b.finish()).unwrap();
    let machine = Machine::new(&module);
    let input = machine.host_ints(&[0i64]);
    let err = machine.call("Broken", vec![input]).unwrap_err();
    assert!(err.message.contains("out of range"));
}
