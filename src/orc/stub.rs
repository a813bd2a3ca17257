//! Indirect stubs whose call target is compiled on first call.
//!
//! A stub is a generated function that loads its target from a [`StubCell`]
//! and calls it. While the target is unset the stub first calls
//! [`resolve_stub`], which runs the lazy compile callback of the cell once and
//! binds the returned address. Every later call goes straight to the target.

use std::{
    ffi::c_void,
    mem, process,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use inkwell::{
    context::Context,
    execution_engine::ExecutionEngine,
    module::{Linkage, Module},
    values::{BasicMetadataValueEnum, BasicValue, FunctionValue},
    AddressSpace, AtomicOrdering,
};
use once_cell::sync::OnceCell;
use tracing::{debug, error};

use crate::{ir::verify, target::JitTarget, types::Signature, Error, ErrorKind};

use super::{LazyCompileFn, StackInner};

/// Symbol of the resolution entry point called by unbound stubs.
const RESOLVE_STUB_SYMBOL: &str = "lazyjit_resolve_stub";

/// Backing storage of one indirect stub. The generated stub code refers to
/// the cell by address, so it must not move while the stub module is live.
pub(crate) struct StubCell<'ctx> {
    symbol: String,
    target: AtomicUsize,
    resolved: OnceCell<usize>,
    callback: Arc<LazyCompileFn<'ctx>>,
    stack: *const StackInner<'ctx>,
}

impl<'ctx> StubCell<'ctx> {
    pub(crate) fn new(
        symbol: &str,
        callback: Arc<LazyCompileFn<'ctx>>,
        stack: &StackInner<'ctx>,
    ) -> Self {
        StubCell {
            symbol: symbol.to_owned(),
            target: AtomicUsize::new(0),
            resolved: OnceCell::new(),
            callback,
            stack,
        }
    }

    /// The address the stub currently forwards to, if any.
    pub(crate) fn bound(&self) -> Option<usize> {
        match self.target.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    /// Bind the stub to `address`. Binding again to the same address is
    /// allowed, binding to a different one is not.
    pub(crate) fn bind(&self, address: usize) -> Result<(), Error> {
        if address == 0 {
            return Err(Error::new(
                ErrorKind::NullAddress,
                format!("cannot bind stub `{}` to a null address", self.symbol),
            ));
        }
        match self
            .target
            .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(symbol = %self.symbol, address, "bound indirect stub");
                Ok(())
            }
            Err(current) if current == address => Ok(()),
            Err(current) => Err(Error::new(
                ErrorKind::StubAlreadyBound,
                format!("stub `{}` is already bound to {current:#x}", self.symbol),
            )),
        }
    }

    /// Return the bound target, running the lazy compile callback if the stub
    /// is still unbound. Concurrent first calls wait for the one running the
    /// callback and then observe its result.
    fn resolve(&self) -> Result<usize, Error> {
        if let Some(address) = self.bound() {
            return Ok(address);
        }
        let address = *self.resolved.get_or_try_init(|| {
            debug!(symbol = %self.symbol, "running lazy compile callback");
            // SAFETY: Cells are owned by the state of the stack they point to.
            let stack = unsafe { &*self.stack };
            let mut session = stack.session()?;
            let address = (self.callback)(&mut session)?;
            // The cell can only be freed by a removal, which needs the lock.
            self.bind(address)?;
            drop(session);
            Ok::<_, Error>(address)
        })?;
        Ok(self.bound().unwrap_or(address))
    }

    pub(crate) fn symbol(&self) -> &str {
        &self.symbol
    }

    fn target_slot(&self) -> usize {
        &self.target as *const AtomicUsize as usize
    }
}

/// Entry point called by generated stub code while its cell is unbound.
extern "C" fn resolve_stub(cell: *const c_void) -> usize {
    // SAFETY: Stub code only passes the address of its own cell, which lives
    // as long as the stub module.
    let cell = unsafe { &*cell.cast::<StubCell<'_>>() };
    match cell.resolve() {
        Ok(address) => address,
        Err(err) => {
            error!(symbol = %cell.symbol, error = %err, "lazy compilation failed");
            process::abort();
        }
    }
}

/// Declare the resolution entry point in `module`.
pub(crate) fn declare_resolver<'ctx>(context: &'ctx Context, module: &Module<'ctx>) -> FunctionValue<'ctx> {
    if let Some(func) = module.get_function(RESOLVE_STUB_SYMBOL) {
        return func;
    }
    let ptr_type = context.i8_type().ptr_type(AddressSpace::default());
    module.add_function(
        RESOLVE_STUB_SYMBOL,
        ptr_type.fn_type(&[ptr_type.into()], false),
        Some(Linkage::External),
    )
}

/// Map the resolution entry point to [`resolve_stub`]. Mappings apply by
/// name, so this is done once per engine through its root module.
pub(crate) fn map_resolver<'ctx>(engine: &ExecutionEngine<'ctx>, resolver: FunctionValue<'ctx>) {
    engine.add_global_mapping(&resolver, resolve_stub as usize);
}

/// Build the module defining the stub function `ir_name` with the given
/// signature, forwarding through `cell`.
pub(crate) fn build_stub_module<'ctx>(
    context: &'ctx Context,
    target: &JitTarget,
    ir_name: &str,
    signature: &Signature,
    cell: &StubCell<'ctx>,
) -> Result<Module<'ctx>, Error> {
    let module = context.create_module(&format!("{ir_name}.stub"));
    target.configure_module(&module);
    let ptr_type = context.i8_type().ptr_type(AddressSpace::default());
    let intptr_type = context.ptr_sized_int_type(&target.target_data(), None);
    let fn_type = signature.fn_type(context);
    let call_conv = signature.call_conv.llvm_id();
    let resolver = declare_resolver(context, &module);
    let stub = module.add_function(ir_name, fn_type, None);
    stub.set_call_conventions(call_conv);
    let entry = context.append_basic_block(stub, "entry");
    let resolve = context.append_basic_block(stub, "resolve");
    let call = context.append_basic_block(stub, "call");
    let builder = context.create_builder();
    builder.position_at_end(entry);
    let slot = intptr_type
        .const_int(cell.target_slot() as u64, false)
        .const_to_pointer(ptr_type);
    let bound = builder
        .build_load(ptr_type, slot, "bound")?
        .into_pointer_value();
    if let Some(load) = bound.as_instruction_value() {
        load.set_alignment(mem::align_of::<usize>() as u32)
            .and_then(|_| load.set_atomic_ordering(AtomicOrdering::Acquire))
            .map_err(|str| Error::new(ErrorKind::Construction, str))?;
    }
    let unbound = builder.build_is_null(bound, "unbound")?;
    builder.build_conditional_branch(unbound, resolve, call)?;
    builder.position_at_end(resolve);
    let cell_ptr = intptr_type
        .const_int(cell as *const StubCell as u64, false)
        .const_to_pointer(ptr_type);
    let resolved = builder
        .build_call(resolver, &[cell_ptr.into()], "resolved")?
        .try_as_basic_value()
        .unwrap_left()
        .into_pointer_value();
    builder.build_unconditional_branch(call)?;
    builder.position_at_end(call);
    let callee = builder.build_phi(ptr_type, "callee")?;
    callee.add_incoming(&[(&bound, entry), (&resolved, resolve)]);
    let args = stub
        .get_param_iter()
        .map(|param| param.into())
        .collect::<Vec<BasicMetadataValueEnum>>();
    let result = builder.build_indirect_call(
        fn_type,
        callee.as_basic_value().into_pointer_value(),
        &args,
        "result",
    )?;
    result.set_call_convention(call_conv);
    result.set_tail_call(true);
    match result.try_as_basic_value().left() {
        Some(value) => builder.build_return(Some(&value))?,
        None => builder.build_return(None)?,
    };
    verify(&module)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use inkwell::context::Context;

    use super::{build_stub_module, StubCell};
    use crate::{
        orc::{JitSession, JitStack, LazyCompileFn},
        Error, ErrorKind, JitTarget, Signature, TargetConfig, ValueType,
    };

    fn never_called<'ctx>() -> Arc<LazyCompileFn<'ctx>> {
        Arc::new(|_: &mut JitSession<'_, 'ctx>| -> Result<usize, Error> {
            panic!("callback must not run")
        })
    }

    #[test]
    fn binding_is_permanent() -> Result<(), Error> {
        let context = Context::create();
        let stack = JitStack::new(&context, JitTarget::detect(&TargetConfig::default())?)?;
        let cell = StubCell::new("fac_stub", never_called(), &stack.inner);
        assert_eq!(cell.bound(), None);
        cell.bind(0x1000)?;
        cell.bind(0x1000)?;
        assert_eq!(cell.bind(0x2000).unwrap_err().kind, ErrorKind::StubAlreadyBound);
        assert_eq!(cell.bind(0).unwrap_err().kind, ErrorKind::NullAddress);
        assert_eq!(cell.bound(), Some(0x1000));
        assert_eq!(cell.resolve()?, 0x1000);
        Ok(())
    }

    #[test]
    fn stub_module_forwards_all_parameters() -> Result<(), Error> {
        let context = Context::create();
        let target = JitTarget::detect(&TargetConfig::default())?;
        let stack = JitStack::new(&context, JitTarget::detect(&TargetConfig::default())?)?;
        let cell = StubCell::new("pair_stub", never_called(), &stack.inner);
        let signature = Signature::new(&[ValueType::I64, ValueType::F64], Some(ValueType::F64));
        let module = build_stub_module(&context, &target, "pair_stub", &signature, &cell)?;
        let stub = module.get_function("pair_stub").unwrap();
        assert_eq!(stub.count_params(), 2);
        assert_eq!(stub.count_basic_blocks(), 3);
        let ir = module.print_to_string().to_string();
        assert!(ir.contains("load atomic ptr"));
        assert!(ir.contains("lazyjit_resolve_stub"));
        assert!(ir.contains("tail call double"));
        Ok(())
    }

    #[test]
    fn void_stub_returns_nothing() -> Result<(), Error> {
        let context = Context::create();
        let target = JitTarget::detect(&TargetConfig::default())?;
        let stack = JitStack::new(&context, JitTarget::detect(&TargetConfig::default())?)?;
        let cell = StubCell::new("tick_stub", never_called(), &stack.inner);
        let module = build_stub_module(&context, &target, "tick_stub", &Signature::new(&[], None), &cell)?;
        assert!(module.print_to_string().to_string().contains("ret void"));
        Ok(())
    }
}
