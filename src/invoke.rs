//! Calling JIT compiled code through its address.

use std::{ffi::c_void, fmt};

use inkwell::{context::Context, values::FunctionValue};
use libffi::middle::{Arg, Cif, CodePtr, Type};

use crate::{
    types::{CallConv, Signature, Value, ValueType},
    Error, ErrorKind,
};

fn ffi_type(ty: ValueType) -> Type {
    match ty {
        ValueType::I32 => Type::i32(),
        ValueType::I64 => Type::i64(),
        ValueType::F64 => Type::f64(),
    }
}

/// A function address paired with the signature and calling convention it
/// must be called with.
pub struct NativeFunction {
    address: usize,
    signature: Signature,
    cif: Cif,
}

impl NativeFunction {
    /// Describe the function at `address`. The calling convention has to be
    /// the one the function was compiled with.
    pub fn new(address: usize, call_conv: CallConv, signature: Signature) -> Result<Self, Error> {
        if address == 0 {
            return Err(Error::new(
                ErrorKind::NullAddress,
                "cannot call a function at a null address",
            ));
        }
        if call_conv != signature.call_conv {
            return Err(Error::new(
                ErrorKind::SignatureMismatch,
                format!(
                    "calling convention {call_conv:?} differs from {:?} of the signature",
                    signature.call_conv
                ),
            ));
        }
        let cif = Cif::new(
            signature.params.iter().copied().map(ffi_type),
            signature.ret.map_or_else(Type::void, ffi_type),
        );
        Ok(NativeFunction {
            address,
            signature,
            cif,
        })
    }

    /// Describe the compiled code of `function` found at `address`, using the
    /// signature and calling convention declared in the IR.
    pub fn of_function<'ctx>(
        address: usize,
        context: &'ctx Context,
        function: FunctionValue<'ctx>,
    ) -> Result<Self, Error> {
        let signature = Signature::of_function(context, function).ok_or_else(|| {
            Error::new(
                ErrorKind::UnsupportedSignature,
                format!(
                    "`{}` has a signature that can not be invoked",
                    function.get_name().to_string_lossy()
                ),
            )
        })?;
        Self::new(address, signature.call_conv, signature)
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    fn check_args(&self, args: &[Value]) -> Result<(), Error> {
        if args.len() != self.signature.params.len() {
            return Err(Error::new(
                ErrorKind::SignatureMismatch,
                format!(
                    "expected {} arguments, got {}",
                    self.signature.params.len(),
                    args.len()
                ),
            ));
        }
        for (i, (arg, param)) in args.iter().zip(&self.signature.params).enumerate() {
            if arg.ty() != *param {
                return Err(Error::new(
                    ErrorKind::SignatureMismatch,
                    format!("argument {i} is {:?}, expected {param:?}", arg.ty()),
                ));
            }
        }
        Ok(())
    }

    /// Call the function with `args`, which must match the parameter types of
    /// the signature. Returns [`None`] for functions returning nothing.
    ///
    /// # Safety
    /// The address must point to live code that really has the described
    /// signature and calling convention.
    pub unsafe fn invoke(&self, args: &[Value]) -> Result<Option<Value>, Error> {
        self.check_args(args)?;
        let args = args
            .iter()
            .map(|arg| match arg {
                Value::I32(v) => Arg::new(v),
                Value::I64(v) => Arg::new(v),
                Value::F64(v) => Arg::new(v),
            })
            .collect::<Vec<_>>();
        let code = CodePtr(self.address as *mut c_void);
        let result = match self.signature.ret {
            None => {
                unsafe { self.cif.call::<()>(code, &args) };
                None
            }
            Some(ValueType::I32) => Some(Value::I32(unsafe { self.cif.call(code, &args) })),
            Some(ValueType::I64) => Some(Value::I64(unsafe { self.cif.call(code, &args) })),
            Some(ValueType::F64) => Some(Value::F64(unsafe { self.cif.call(code, &args) })),
        };
        Ok(result)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("address", &format_args!("{:#x}", self.address))
            .field("signature", &self.signature)
            .finish()
    }
}
