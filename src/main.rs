//! Compile and run a factorial function through the lazy JIT stack.

use anyhow::bail;
use clap::{ArgAction, Parser, ValueEnum};
use inkwell::context::Context;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;

use lazyjit::{
    CallConv, CompilationMode, FactorialModule, JitSession, JitStack, JitTarget, ModuleBuilder,
    NativeFunction, SymbolScope, TargetConfig, Value,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    /// Compile the module while adding it
    Eager,
    /// Compile the module on the first call
    Lazy,
    /// Call through an indirect stub whose callback adds the module
    Stub,
}

#[derive(Parser)]
#[command(name = "lazyjit")]
#[command(version, about = "Run a JIT compiled factorial", long_about = None)]
struct Cli {
    /// How the factorial is compiled and reached
    #[arg(long, value_enum, default_value_t = Strategy::Lazy)]
    strategy: Strategy,

    /// Argument passed to the factorial
    #[arg(short, default_value_t = 10, value_parser = clap::value_parser!(i32).range(0..))]
    n: i32,

    /// Optimization level
    #[arg(short = 'O', default_value_t = 3, value_parser = clap::value_parser!(u32).range(0..=3))]
    opt_level: u32,

    /// Target triple to use instead of the host default
    #[arg(long)]
    triple: Option<String>,

    /// Print the generated module before running it
    #[arg(long)]
    print_ir: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// Symbol resolver of the CLI. The factorial has no external references, so
/// every query only gets logged.
fn log_symbol_lookup(name: &str) -> Option<usize> {
    trace!(symbol = name, "symbol resolver queried");
    None
}

fn call_fac(address: usize, builder: &FactorialModule, n: i32) -> anyhow::Result<i32> {
    let function = NativeFunction::new(address, CallConv::C, builder.signature())?;
    // SAFETY: The address was resolved for code built by `builder`.
    match unsafe { function.invoke(&[Value::I32(n)])? } {
        Some(Value::I32(result)) => Ok(result),
        other => bail!("unexpected result {other:?}"),
    }
}

/// Add the module and call the function through the address found in its
/// module handle.
fn run_direct(
    stack: &JitStack<'_>,
    builder: &FactorialModule,
    mode: CompilationMode,
    n: i32,
) -> anyhow::Result<i32> {
    let symbol = stack.mangle(builder.function_name());
    println!("Mangled symbol name: {symbol}");
    let module = builder.build(stack.context())?;
    let handle = stack.add_module(module, log_symbol_lookup, mode)?;
    println!("Module handle: {}", handle.id());
    let address = stack.get_symbol_address(&symbol, SymbolScope::InHandle(handle))?;
    println!("Function address: {address:#x}");
    call_fac(address, builder, n)
}

/// Call the function through an indirect stub. The module is only built and
/// added by the stub's callback, on the first call.
fn run_stub<'ctx>(stack: &JitStack<'ctx>, builder: &FactorialModule, n: i32) -> anyhow::Result<i32> {
    let symbol = stack.mangle(builder.function_name());
    println!("Mangled symbol name: {symbol}");
    let stub = stack.mangle(&format!("{}_stub", builder.function_name()));
    let callback = {
        let builder = builder.clone();
        let stub = stub.clone();
        stack.create_lazy_callback(move |session: &mut JitSession<'_, 'ctx>| {
            info!(%stub, "lazy compile callback");
            let module = builder.build(session.context())?;
            let handle = session.add_module(module, log_symbol_lookup, CompilationMode::Lazy)?;
            println!("Module handle: {}", handle.id());
            let address = session.get_symbol_address(&symbol, SymbolScope::InHandle(handle))?;
            println!("{symbol} function address: {address:#x}");
            session.set_indirect_stub_pointer(&stub, address)?;
            Ok(address)
        })?
    };
    stack.create_indirect_stub(&stub, &builder.signature(), callback)?;
    let address = stack.get_symbol_address(&stub, SymbolScope::Global)?;
    println!("Stub-function address: {address:#x}");
    call_fac(address, builder, n)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = TargetConfig {
        triple: cli.triple,
        opt_level: cli.opt_level,
        ..TargetConfig::default()
    };
    let target = JitTarget::detect(&config)?;
    let descriptor = target.descriptor();
    println!("Target information triplet: {}", descriptor.triple);
    println!("Target machine name: {}", descriptor.name);
    println!("Target machine description: {}", descriptor.description);

    let context = Context::create();
    let builder = FactorialModule::new();
    if cli.print_ir {
        let module = builder.build(&context)?;
        target.configure_module(&module);
        print!("{}", module.print_to_string().to_string());
    }
    let stack = JitStack::new(&context, target)?;
    let result = match cli.strategy {
        Strategy::Eager => run_direct(&stack, &builder, CompilationMode::Eager, cli.n)?,
        Strategy::Lazy => run_direct(&stack, &builder, CompilationMode::Lazy, cli.n)?,
        Strategy::Stub => run_stub(&stack, &builder, cli.n)?,
    };
    println!("result: {result}");
    stack.dispose()?;
    println!("finished");
    Ok(())
}
