//! Benchmark calls into JIT compiled code.

use std::hint::black_box;

use iai_callgrind::{library_benchmark, library_benchmark_group, main};
use inkwell::context::Context;
use lazyjit::{
    no_external_symbols, CallConv, CompilationMode, FactorialModule, JitStack, JitTarget,
    ModuleBuilder, NativeFunction, SymbolScope, TargetConfig, Value,
};

enum Route {
    Direct,
    Stub,
}

struct Prepared {
    _stack: JitStack<'static>,
    function: NativeFunction,
}

fn prepare(route: Route) -> Prepared {
    let context = Box::leak(Box::new(Context::create()));
    let target = JitTarget::detect(&TargetConfig::default()).unwrap();
    let stack = JitStack::new(context, target).unwrap();
    let builder = FactorialModule::new();
    let module = builder.build(context).unwrap();
    stack
        .add_module(module, no_external_symbols, CompilationMode::Eager)
        .unwrap();
    let fac = stack
        .get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)
        .unwrap();
    let address = match route {
        Route::Direct => fac,
        Route::Stub => {
            let callback = stack.create_lazy_callback(move |_| Ok(fac)).unwrap();
            let stub = stack.mangle("fac_stub");
            stack
                .create_indirect_stub(&stub, &builder.signature(), callback)
                .unwrap();
            stack.set_indirect_stub_pointer(&stub, fac).unwrap();
            stack
                .get_symbol_address(&stub, SymbolScope::Global)
                .unwrap()
        }
    };
    let function = NativeFunction::new(address, CallConv::C, builder.signature()).unwrap();
    Prepared {
        _stack: stack,
        function,
    }
}

#[library_benchmark]
#[benches::with_setup(args = [Route::Direct, Route::Stub], setup = prepare)]
fn bench_fac_call(prepared: Prepared) -> (Prepared, Option<Value>) {
    let result = unsafe { prepared.function.invoke(black_box(&[Value::I32(10)])) }.unwrap();
    (prepared, black_box(result))
}

library_benchmark_group!(
    name = bench_call_group;
    benchmarks = bench_fac_call
);

main!(library_benchmark_groups = bench_call_group);
