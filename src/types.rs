//! Typed descriptors shared between IR construction and native invocation.

use inkwell::{
    context::Context,
    types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType},
    values::FunctionValue,
};

/// Calling convention of a JIT compiled function. The IR declares the same
/// convention that the invocation bridge uses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum CallConv {
    #[default]
    C,
}

impl CallConv {
    /// The LLVM calling convention id.
    pub fn llvm_id(self) -> u32 {
        match self {
            CallConv::C => 0,
        }
    }

    fn from_llvm_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(CallConv::C),
            _ => None,
        }
    }
}

/// Types that may appear as parameter or return type of an invocable function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ValueType {
    I32,
    I64,
    F64,
}

impl ValueType {
    pub fn llvm_type<'ctx>(self, context: &'ctx Context) -> BasicTypeEnum<'ctx> {
        match self {
            ValueType::I32 => context.i32_type().into(),
            ValueType::I64 => context.i64_type().into(),
            ValueType::F64 => context.f64_type().into(),
        }
    }

    fn from_llvm<'ctx>(context: &'ctx Context, ty: BasicTypeEnum<'ctx>) -> Option<Self> {
        match ty {
            BasicTypeEnum::IntType(int) if int.get_bit_width() == 32 => Some(ValueType::I32),
            BasicTypeEnum::IntType(int) if int.get_bit_width() == 64 => Some(ValueType::I64),
            BasicTypeEnum::FloatType(float) if float == context.f64_type() => Some(ValueType::F64),
            _ => None,
        }
    }
}

/// A single argument or return value.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Value {
    I32(i32),
    I64(i64),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F64(_) => ValueType::F64,
        }
    }
}

/// Parameter and return types of a function, together with its calling
/// convention.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Signature {
    pub call_conv: CallConv,
    pub params: Vec<ValueType>,
    pub ret: Option<ValueType>,
}

impl Signature {
    /// Create a signature using the C calling convention.
    pub fn new(params: &[ValueType], ret: Option<ValueType>) -> Self {
        Signature {
            call_conv: CallConv::C,
            params: params.to_vec(),
            ret,
        }
    }

    /// Build the LLVM function type for this signature.
    pub fn fn_type<'ctx>(&self, context: &'ctx Context) -> FunctionType<'ctx> {
        let params = self
            .params
            .iter()
            .map(|param| param.llvm_type(context).into())
            .collect::<Vec<BasicMetadataTypeEnum>>();
        match self.ret {
            Some(ret) => ret.llvm_type(context).fn_type(&params, false),
            None => context.void_type().fn_type(&params, false),
        }
    }

    /// Derive the signature of an existing function. Returns [`None`] if any of
    /// its types or its calling convention can not be expressed.
    pub fn of_function<'ctx>(context: &'ctx Context, function: FunctionValue<'ctx>) -> Option<Self> {
        let call_conv = CallConv::from_llvm_id(function.get_call_conventions())?;
        let mut params = Vec::new();
        for param in function.get_param_iter() {
            params.push(ValueType::from_llvm(context, param.get_type())?);
        }
        let ret = match function.get_type().get_return_type() {
            Some(ty) => Some(ValueType::from_llvm(context, ty)?),
            None => None,
        };
        Some(Signature {
            call_conv,
            params,
            ret,
        })
    }
}

#[cfg(test)]
mod tests {
    use inkwell::context::Context;

    use super::{CallConv, Signature, Value, ValueType};

    #[test]
    fn signature_round_trips_through_function_type() {
        let context = Context::create();
        let module = context.create_module("sig");
        let sig = Signature::new(&[ValueType::I64, ValueType::F64], Some(ValueType::I32));
        let func = module.add_function("f", sig.fn_type(&context), None);
        assert_eq!(Signature::of_function(&context, func), Some(sig));
    }

    #[test]
    fn void_return_is_none() {
        let context = Context::create();
        let module = context.create_module("sig");
        let sig = Signature::new(&[], None);
        let func = module.add_function("g", sig.fn_type(&context), None);
        assert_eq!(Signature::of_function(&context, func).unwrap().ret, None);
    }

    #[test]
    fn unsupported_types_have_no_signature() {
        let context = Context::create();
        let module = context.create_module("sig");
        let fn_type = context.i8_type().fn_type(&[context.i16_type().into()], false);
        let func = module.add_function("h", fn_type, None);
        assert_eq!(Signature::of_function(&context, func), None);
    }

    #[test]
    fn fast_call_conv_has_no_signature() {
        let context = Context::create();
        let module = context.create_module("sig");
        let sig = Signature::new(&[ValueType::I32], Some(ValueType::I32));
        let func = module.add_function("k", sig.fn_type(&context), None);
        func.set_call_conventions(8);
        assert_eq!(Signature::of_function(&context, func), None);
        assert_eq!(CallConv::C.llvm_id(), 0);
    }

    #[test]
    fn value_types() {
        assert_eq!(Value::I32(1).ty(), ValueType::I32);
        assert_eq!(Value::I64(1).ty(), ValueType::I64);
        assert_eq!(Value::F64(1.0).ty(), ValueType::F64);
    }
}
