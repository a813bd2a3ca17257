#[cfg(test)]
use crate::{CallConv, Error, NativeFunction, Signature, Value, ValueType};

/// Call the `i32 (i32)` function at `address`.
#[cfg(test)]
pub(crate) fn invoke_i32(address: usize, n: i32) -> Result<i32, Error> {
    let signature = Signature::new(&[ValueType::I32], Some(ValueType::I32));
    let function = NativeFunction::new(address, CallConv::C, signature)?;
    match unsafe { function.invoke(&[Value::I32(n)])? } {
        Some(Value::I32(result)) => Ok(result),
        other => panic!("unexpected result {other:?}"),
    }
}

#[cfg(test)]
pub(crate) extern "C" fn host_double(n: i32) -> i32 {
    n.wrapping_mul(2)
}

#[cfg(test)]
pub(crate) extern "C" fn host_triple(n: i32) -> i32 {
    n.wrapping_mul(3)
}

macro_rules! compilation_mode_tests {
    ($name:ident, $mode:expr) => {
        #[cfg(test)]
        mod $name {
            use std::cell::RefCell;

            use inkwell::context::Context;

            use super::testdef::{host_double, host_triple, invoke_i32};
            use crate::{
                no_external_symbols, CallerModule, CompilationMode, Error, ErrorKind,
                FactorialModule, JitStack, JitTarget, ModuleBuilder, SymbolScope, TargetConfig,
            };

            const MODE: CompilationMode = $mode;

            fn new_stack(context: &Context) -> Result<JitStack<'_>, Error> {
                JitStack::new(context, JitTarget::detect(&TargetConfig::default())?)
            }

            #[test]
            fn factorial_values() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let module = FactorialModule::new().build(&context)?;
                stack.add_module(module, no_external_symbols, MODE)?;
                let fac = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(fac, 0)?, 1);
                assert_eq!(invoke_i32(fac, 1)?, 1);
                assert_eq!(invoke_i32(fac, 5)?, 120);
                assert_eq!(invoke_i32(fac, 10)?, 3628800);
                Ok(())
            }

            #[test]
            fn factorial_without_optimization() -> Result<(), Error> {
                let context = Context::create();
                let config = TargetConfig {
                    opt_level: 0,
                    ..TargetConfig::default()
                };
                let stack = JitStack::new(&context, JitTarget::detect(&config)?)?;
                let module = FactorialModule::new().build(&context)?;
                stack.add_module(module, no_external_symbols, MODE)?;
                let fac = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(fac, 8)?, 40320);
                Ok(())
            }

            #[test]
            fn scoped_lookup_matches_global_lookup() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let module = FactorialModule::new().build(&context)?;
                let handle = stack.add_module(module, no_external_symbols, MODE)?;
                let fac = stack.mangle("fac");
                let scoped = stack.get_symbol_address(&fac, SymbolScope::InHandle(handle))?;
                let global = stack.get_symbol_address(&fac, SymbolScope::Global)?;
                assert_eq!(scoped, global);
                assert_eq!(stack.get_symbol_address(&fac, SymbolScope::Global)?, global);
                Ok(())
            }

            #[test]
            fn unknown_symbol_is_not_found() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let module = FactorialModule::new().build(&context)?;
                let handle = stack.add_module(module, no_external_symbols, MODE)?;
                let missing = stack.mangle("missing");
                let error = stack
                    .get_symbol_address(&missing, SymbolScope::Global)
                    .unwrap_err();
                assert!(error.is_not_found());
                let error = stack
                    .get_symbol_address(&missing, SymbolScope::InHandle(handle))
                    .unwrap_err();
                assert!(error.is_not_found());
                Ok(())
            }

            #[test]
            fn symbol_of_other_module_is_not_in_handle() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let fac = FactorialModule::new().build(&context)?;
                let other = FactorialModule::named("other_fac").build(&context)?;
                stack.add_module(fac, no_external_symbols, MODE)?;
                let handle = stack.add_module(other, no_external_symbols, MODE)?;
                let error = stack
                    .get_symbol_address(&stack.mangle("fac"), SymbolScope::InHandle(handle))
                    .unwrap_err();
                assert!(error.is_not_found());
                let other_fac = stack
                    .get_symbol_address(&stack.mangle("other_fac"), SymbolScope::InHandle(handle))?;
                assert_eq!(invoke_i32(other_fac, 4)?, 24);
                Ok(())
            }

            #[test]
            fn removed_module_is_gone() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let module = FactorialModule::new().build(&context)?;
                let handle = stack.add_module(module, no_external_symbols, MODE)?;
                let fac = stack.mangle("fac");
                stack.get_symbol_address(&fac, SymbolScope::Global)?;
                stack.remove_module(handle)?;
                assert!(stack.session()?.is_removed(handle));
                let error = stack
                    .get_symbol_address(&fac, SymbolScope::InHandle(handle))
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::HandleInvalidated);
                let error = stack
                    .get_symbol_address(&fac, SymbolScope::Global)
                    .unwrap_err();
                assert!(error.is_not_found());
                let error = stack.remove_module(handle).unwrap_err();
                assert_eq!(error.kind, ErrorKind::HandleInvalidated);
                Ok(())
            }

            #[test]
            fn removed_names_can_not_be_redefined() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let module = FactorialModule::new().build(&context)?;
                let handle = stack.add_module(module, no_external_symbols, MODE)?;
                let fac = stack.mangle("fac");
                let address = stack.get_symbol_address(&fac, SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, 5)?, 120);
                stack.remove_module(handle)?;
                let module = FactorialModule::new().build(&context)?;
                let error = stack
                    .add_module(module, no_external_symbols, MODE)
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::DuplicateSymbol);
                assert!(error.str.contains("removed module"));
                assert!(stack
                    .get_symbol_address(&fac, SymbolScope::Global)
                    .unwrap_err()
                    .is_not_found());
                let caller = CallerModule::new("fac_plus_one", "fac", 1).build(&context)?;
                let error = stack
                    .add_module(caller, no_external_symbols, MODE)
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::Orc);
                let module = FactorialModule::named("fresh_fac").build(&context)?;
                let handle = stack.add_module(module, no_external_symbols, MODE)?;
                let address = stack
                    .get_symbol_address(&stack.mangle("fresh_fac"), SymbolScope::InHandle(handle))?;
                assert_eq!(invoke_i32(address, 5)?, 120);
                Ok(())
            }

            #[test]
            fn duplicate_definition_is_rejected() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let first = FactorialModule::new().build(&context)?;
                let second = FactorialModule::new().build(&context)?;
                stack.add_module(first, no_external_symbols, MODE)?;
                let error = stack
                    .add_module(second, no_external_symbols, MODE)
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::DuplicateSymbol);
                let fac = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(fac, 3)?, 6);
                Ok(())
            }

            #[test]
            fn references_resolve_within_stack() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let fac = FactorialModule::new().build(&context)?;
                let caller = CallerModule::new("fac_plus_one", "fac", 1).build(&context)?;
                stack.add_module(fac, no_external_symbols, MODE)?;
                let queried = RefCell::new(Vec::new());
                stack.add_module(
                    caller,
                    |name: &str| {
                        queried.borrow_mut().push(name.to_owned());
                        None
                    },
                    MODE,
                )?;
                assert!(queried.borrow().is_empty());
                let address = stack
                    .get_symbol_address(&stack.mangle("fac_plus_one"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, 5)?, 121);
                Ok(())
            }

            #[test]
            fn resolver_provides_external_symbols() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let caller = CallerModule::new("double_plus_three", "host_double", 3)
                    .build(&context)?;
                let expected = stack.mangle("host_double");
                let queried = RefCell::new(Vec::new());
                stack.add_module(
                    caller,
                    |name: &str| {
                        queried.borrow_mut().push(name.to_owned());
                        (name == expected.as_str()).then_some(host_double as usize)
                    },
                    MODE,
                )?;
                assert_eq!(*queried.borrow(), [expected.to_string()]);
                let address = stack
                    .get_symbol_address(&stack.mangle("double_plus_three"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, 20)?, 43);
                Ok(())
            }

            #[test]
            fn process_symbols_resolve_without_resolver() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let caller = CallerModule::new("abs_plus_one", "abs", 1).build(&context)?;
                stack.add_module(caller, no_external_symbols, MODE)?;
                let address = stack
                    .get_symbol_address(&stack.mangle("abs_plus_one"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, -5)?, 6);
                Ok(())
            }

            #[test]
            fn unresolved_external_is_an_error() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let caller = CallerModule::new("g", "lazyjit_no_such_symbol", 1).build(&context)?;
                let error = stack
                    .add_module(caller, no_external_symbols, MODE)
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::Orc);
                assert!(error.str.contains("lazyjit_no_such_symbol"));
                Ok(())
            }

            #[test]
            fn failed_addition_leaves_no_symbols() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let caller = CallerModule::new("g", "lazyjit_no_such_symbol", 1).build(&context)?;
                stack
                    .add_module(caller, no_external_symbols, MODE)
                    .unwrap_err();
                let g = stack.mangle("g");
                assert!(stack
                    .get_symbol_address(&g, SymbolScope::Global)
                    .unwrap_err()
                    .is_not_found());
                let caller = CallerModule::new("g", "host_double", 1).build(&context)?;
                let host = stack.mangle("host_double");
                let handle = stack.add_module(
                    caller,
                    |name: &str| (name == host.as_str()).then_some(host_double as usize),
                    MODE,
                )?;
                let address = stack.get_symbol_address(&g, SymbolScope::InHandle(handle))?;
                assert_eq!(invoke_i32(address, 4)?, 9);
                Ok(())
            }

            #[test]
            fn conflicting_resolver_answers_are_rejected() -> Result<(), Error> {
                let context = Context::create();
                let stack = new_stack(&context)?;
                let host = stack.mangle("host_double");
                let first = CallerModule::new("double_plus_one", "host_double", 1)
                    .build(&context)?;
                stack.add_module(
                    first,
                    |name: &str| (name == host.as_str()).then_some(host_double as usize),
                    MODE,
                )?;
                let second = CallerModule::new("double_plus_two", "host_double", 2)
                    .build(&context)?;
                let error = stack
                    .add_module(
                        second,
                        |name: &str| (name == host.as_str()).then_some(host_triple as usize),
                        MODE,
                    )
                    .unwrap_err();
                assert_eq!(error.kind, ErrorKind::Orc);
                assert!(error.str.contains(host.as_str()));
                let second = CallerModule::new("double_plus_two", "host_double", 2)
                    .build(&context)?;
                stack.add_module(
                    second,
                    |name: &str| (name == host.as_str()).then_some(host_double as usize),
                    MODE,
                )?;
                let address = stack
                    .get_symbol_address(&stack.mangle("double_plus_two"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, 10)?, 22);
                let address = stack
                    .get_symbol_address(&stack.mangle("double_plus_one"), SymbolScope::Global)?;
                assert_eq!(invoke_i32(address, 10)?, 21);
                Ok(())
            }
        }
    };
}
