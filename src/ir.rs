//! Hand built IR modules.

use inkwell::{
    builder::BuilderError, context::Context, module::Module, values::BasicValue, IntPredicate,
};

use crate::{
    types::{Signature, ValueType},
    Error, ErrorKind,
};

/// Something that can synthesize a fresh compilation unit defining one
/// externally visible function.
pub trait ModuleBuilder {
    /// Name of the function defined by the built module.
    fn function_name(&self) -> &str;

    /// Signature of the function defined by the built module.
    fn signature(&self) -> Signature;

    /// Build a new module in `context`. Repeated calls produce structurally
    /// identical but independent modules.
    fn build<'ctx>(&self, context: &'ctx Context) -> Result<Module<'ctx>, Error>;
}

/// Create a construction error with the given string.
fn construction_error<S: ToString>(str: S) -> Error {
    Error::new(ErrorKind::Construction, str)
}

/// Run the LLVM verifier over `module`.
pub fn verify(module: &Module) -> Result<(), Error> {
    module.verify().map_err(construction_error)
}

/// Builds `i32 fac(i32 n)`, the recursive factorial:
/// `if n == 0 then 1 else n * fac(n - 1)`.
#[derive(Clone, Debug)]
pub struct FactorialModule {
    name: String,
}

impl FactorialModule {
    pub fn new() -> Self {
        Self::named("fac")
    }

    pub fn named(name: &str) -> Self {
        FactorialModule {
            name: name.to_owned(),
        }
    }

    fn build_body<'ctx>(&self, context: &'ctx Context, module: &Module<'ctx>) -> Result<(), BuilderError> {
        let int_type = context.i32_type();
        let fac = module.add_function(&self.name, self.signature().fn_type(context), None);
        fac.set_call_conventions(self.signature().call_conv.llvm_id());
        let n = fac.get_nth_param(0).unwrap().into_int_value();
        let entry = context.append_basic_block(fac, "entry");
        let iftrue = context.append_basic_block(fac, "iftrue");
        let iffalse = context.append_basic_block(fac, "iffalse");
        let end = context.append_basic_block(fac, "end");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        let is_zero =
            builder.build_int_compare(IntPredicate::EQ, n, int_type.const_zero(), "n == 0")?;
        builder.build_conditional_branch(is_zero, iftrue, iffalse)?;
        builder.position_at_end(iftrue);
        let res_iftrue = int_type.const_int(1, false);
        builder.build_unconditional_branch(end)?;
        builder.position_at_end(iffalse);
        let n_minus = builder.build_int_sub(n, int_type.const_int(1, false), "n - 1")?;
        let call = builder.build_call(fac, &[n_minus.into()], "fac(n - 1)")?;
        call.set_call_convention(self.signature().call_conv.llvm_id());
        let call_fac = call.try_as_basic_value().unwrap_left().into_int_value();
        let res_iffalse = builder.build_int_mul(n, call_fac, "n * fac(n - 1)")?;
        builder.build_unconditional_branch(end)?;
        builder.position_at_end(end);
        let res = builder.build_phi(int_type, "result")?;
        res.add_incoming(&[(&res_iftrue, iftrue), (&res_iffalse, iffalse)]);
        builder.build_return(Some(&res.as_basic_value()))?;
        Ok(())
    }
}

impl Default for FactorialModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder for FactorialModule {
    fn function_name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        Signature::new(&[ValueType::I32], Some(ValueType::I32))
    }

    fn build<'ctx>(&self, context: &'ctx Context) -> Result<Module<'ctx>, Error> {
        let module = context.create_module(&format!("{}_module", self.name));
        self.build_body(context, &module)
            .map_err(construction_error)?;
        Ok(module)
    }
}

/// Builds `i32 name(i32 n) = callee(n) + offset` where `callee` is only
/// declared. Used to exercise resolution of symbols defined elsewhere.
#[derive(Clone, Debug)]
pub struct CallerModule {
    name: String,
    callee: String,
    offset: i32,
}

impl CallerModule {
    pub fn new(name: &str, callee: &str, offset: i32) -> Self {
        CallerModule {
            name: name.to_owned(),
            callee: callee.to_owned(),
            offset,
        }
    }

    fn build_body<'ctx>(&self, context: &'ctx Context, module: &Module<'ctx>) -> Result<(), BuilderError> {
        let int_type = context.i32_type();
        let fn_type = self.signature().fn_type(context);
        let callee = module.add_function(&self.callee, fn_type, None);
        let func = module.add_function(&self.name, fn_type, None);
        let n = func.get_nth_param(0).unwrap().into_int_value();
        let entry = context.append_basic_block(func, "entry");
        let builder = context.create_builder();
        builder.position_at_end(entry);
        let value = builder
            .build_call(callee, &[n.into()], "value")?
            .try_as_basic_value()
            .unwrap_left()
            .into_int_value();
        let offset = int_type.const_int(self.offset as u64, true);
        let result = builder.build_int_add(value, offset, "result")?;
        builder.build_return(Some(&result.as_basic_value_enum()))?;
        Ok(())
    }
}

impl ModuleBuilder for CallerModule {
    fn function_name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        Signature::new(&[ValueType::I32], Some(ValueType::I32))
    }

    fn build<'ctx>(&self, context: &'ctx Context) -> Result<Module<'ctx>, Error> {
        let module = context.create_module(&format!("{}_module", self.name));
        self.build_body(context, &module)
            .map_err(construction_error)?;
        Ok(module)
    }
}
