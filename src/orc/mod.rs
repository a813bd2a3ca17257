//! A lazily resolving compilation stack on top of LLVM's MCJIT.
//!
//! All state lives behind one lock. Operations on a [`JitStack`] take the lock
//! for their duration, while lazy compile callbacks receive the already locked
//! [`JitSession`] of the stub resolution that invoked them. A callback must
//! only use that session, since reaching back into the [`JitStack`] from the
//! same thread would wait on the lock forever.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use inkwell::{
    context::Context,
    execution_engine::ExecutionEngine,
    module::{Linkage, Module},
    passes::PassBuilderOptions,
    support,
    values::FunctionValue,
};
use tracing::{debug, info, trace, warn};

use crate::{
    ir::verify,
    target::{JitTarget, MangledSymbol},
    types::Signature,
    Error, ErrorKind,
};

use stub::StubCell;

#[macro_use]
mod testdef;
mod stub;

/// How the functions of an added module are compiled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompilationMode {
    /// Compile every function while the module is added.
    Eager,
    /// Compile the module on the first call of any of its functions.
    Lazy,
}

/// Opaque identifier of a module added to a [`JitStack`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ModuleHandle(u64);

impl ModuleHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Opaque identifier of a lazy compile callback registered with a [`JitStack`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallbackHandle(u64);

/// Where a symbol lookup searches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymbolScope {
    /// All symbols defined by live modules and stubs.
    Global,
    /// Only the symbols defined by the given module.
    InHandle(ModuleHandle),
}

/// A lazy compile callback. It runs at most once per stub, on the first call
/// of the stub, and returns the address the stub should forward to.
pub type LazyCompileFn<'ctx> =
    dyn Fn(&mut JitSession<'_, 'ctx>) -> Result<usize, Error> + Send + Sync + 'ctx;

/// Symbol resolver that resolves nothing. Undefined references then fall back
/// to the symbols of the current process.
pub fn no_external_symbols(_: &str) -> Option<usize> {
    None
}

fn orc_error<S: ToString>(str: S) -> Error {
    Error::new(ErrorKind::Orc, str)
}

fn disposed_error() -> Error {
    Error::new(ErrorKind::Disposed, "the jit stack has been disposed")
}

fn not_found_error(symbol: &str) -> Error {
    Error::new(
        ErrorKind::SymbolNotFound,
        format!("symbol `{symbol}` is not defined"),
    )
}

fn handle_error(handle: ModuleHandle) -> Error {
    Error::new(
        ErrorKind::HandleInvalidated,
        format!("module handle {} is not live", handle.0),
    )
}

enum SymbolKind {
    /// A function defined directly by a module. `address` is known once the
    /// function has been compiled.
    Function {
        ir_name: String,
        address: Option<usize>,
    },
    /// A symbol whose address is the one of the stub with the same name.
    Stub,
}

struct SymbolEntry {
    /// The module defining the symbol. Explicitly created stubs belong to the
    /// stack itself.
    owner: Option<ModuleHandle>,
    kind: SymbolKind,
}

struct ModuleEntry<'ctx> {
    module: Module<'ctx>,
    symbols: Vec<String>,
    ir_names: Vec<String>,
}

struct StubSlot<'ctx> {
    cell: Box<StubCell<'ctx>>,
    module: Module<'ctx>,
    address: usize,
}

struct StackState<'ctx> {
    engine: Option<ExecutionEngine<'ctx>>,
    root: Option<Module<'ctx>>,
    next_id: u64,
    /// External names already mapped to a resolver provided address.
    mapped: HashMap<String, usize>,
    modules: HashMap<ModuleHandle, ModuleEntry<'ctx>>,
    /// Handles of removed modules. Grows for the life of the stack.
    removed: HashSet<ModuleHandle>,
    /// IR names defined by removed modules. MCJIT keeps the code of removed
    /// modules linked, so these names can never be defined again.
    retired: HashSet<String>,
    symbols: HashMap<String, SymbolEntry>,
    stubs: HashMap<String, StubSlot<'ctx>>,
    callbacks: HashMap<CallbackHandle, Arc<LazyCompileFn<'ctx>>>,
}

impl<'ctx> StackState<'ctx> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn dispose(&mut self) -> Result<(), Error> {
        let engine = self.engine.take().ok_or_else(disposed_error)?;
        self.stubs.clear();
        self.symbols.clear();
        self.callbacks.clear();
        self.mapped.clear();
        self.retired.clear();
        self.modules.clear();
        self.root = None;
        drop(engine);
        info!("disposed jit stack");
        Ok(())
    }
}

pub(crate) struct StackInner<'ctx> {
    context: &'ctx Context,
    target: JitTarget,
    state: Mutex<StackState<'ctx>>,
}

impl<'ctx> StackInner<'ctx> {
    fn session(&self) -> Result<JitSession<'_, 'ctx>, Error> {
        let state = self
            .state
            .lock()
            .map_err(|_| orc_error("jit stack lock poisoned"))?;
        if state.engine.is_none() {
            return Err(disposed_error());
        }
        Ok(JitSession { inner: self, state })
    }
}

/// A compilation stack holding an execution engine together with the modules,
/// stubs and lazy compile callbacks created through it.
pub struct JitStack<'ctx> {
    inner: Box<StackInner<'ctx>>,
}

impl<'ctx> JitStack<'ctx> {
    /// Create a stack generating code for `target`.
    pub fn new(context: &'ctx Context, target: JitTarget) -> Result<Self, Error> {
        let root = context.create_module("lazyjit.root");
        target.configure_module(&root);
        let resolver = stub::declare_resolver(context, &root);
        let engine = root
            .create_jit_execution_engine(target.optimization_level())
            .map_err(|str| orc_error(str.to_string_lossy()))?;
        stub::map_resolver(&engine, resolver);
        info!(triple = %target.descriptor().triple, "created jit stack");
        Ok(JitStack {
            inner: Box::new(StackInner {
                context,
                target,
                state: Mutex::new(StackState {
                    engine: Some(engine),
                    root: Some(root),
                    next_id: 1,
                    mapped: HashMap::new(),
                    modules: HashMap::new(),
                    removed: HashSet::new(),
                    retired: HashSet::new(),
                    symbols: HashMap::new(),
                    stubs: HashMap::new(),
                    callbacks: HashMap::new(),
                }),
            }),
        })
    }

    pub fn context(&self) -> &'ctx Context {
        self.inner.context
    }

    pub fn target(&self) -> &JitTarget {
        &self.inner.target
    }

    /// Lock the stack for a sequence of operations.
    pub fn session(&self) -> Result<JitSession<'_, 'ctx>, Error> {
        self.inner.session()
    }

    pub fn mangle(&self, name: &str) -> MangledSymbol {
        self.inner.target.mangler().mangle(name)
    }

    /// See [`JitSession::add_module`].
    pub fn add_module<R>(
        &self,
        module: Module<'ctx>,
        resolver: R,
        mode: CompilationMode,
    ) -> Result<ModuleHandle, Error>
    where
        R: FnMut(&str) -> Option<usize>,
    {
        self.session()?.add_module(module, resolver, mode)
    }

    /// See [`JitSession::create_lazy_callback`].
    pub fn create_lazy_callback<F>(&self, callback: F) -> Result<CallbackHandle, Error>
    where
        F: Fn(&mut JitSession<'_, 'ctx>) -> Result<usize, Error> + Send + Sync + 'ctx,
    {
        Ok(self.session()?.create_lazy_callback(callback))
    }

    /// See [`JitSession::create_indirect_stub`].
    pub fn create_indirect_stub(
        &self,
        name: &str,
        signature: &Signature,
        callback: CallbackHandle,
    ) -> Result<(), Error> {
        self.session()?
            .create_indirect_stub(name, signature, callback)
    }

    /// See [`JitSession::set_indirect_stub_pointer`].
    pub fn set_indirect_stub_pointer(&self, name: &str, address: usize) -> Result<(), Error> {
        self.session()?.set_indirect_stub_pointer(name, address)
    }

    /// See [`JitSession::get_stub_pointer`].
    pub fn get_stub_pointer(&self, name: &str) -> Result<usize, Error> {
        self.session()?.get_stub_pointer(name)
    }

    /// See [`JitSession::get_symbol_address`].
    pub fn get_symbol_address(&self, name: &str, scope: SymbolScope) -> Result<usize, Error> {
        self.session()?.get_symbol_address(name, scope)
    }

    /// See [`JitSession::remove_module`].
    pub fn remove_module(&self, handle: ModuleHandle) -> Result<(), Error> {
        self.session()?.remove_module(handle)
    }

    /// Release the execution engine together with all modules, stubs and
    /// callbacks. Every address handed out before becomes invalid. Later
    /// operations, including a second dispose, fail with
    /// [`ErrorKind::Disposed`].
    pub fn dispose(&self) -> Result<(), Error> {
        self.inner
            .state
            .lock()
            .map_err(|_| orc_error("jit stack lock poisoned"))?
            .dispose()
    }
}

impl<'ctx> Drop for JitStack<'ctx> {
    fn drop(&mut self) {
        let state = self
            .inner
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if state.engine.is_some() {
            let _ = state.dispose();
        }
    }
}

/// Exclusive access to a [`JitStack`].
pub struct JitSession<'a, 'ctx> {
    inner: &'a StackInner<'ctx>,
    state: MutexGuard<'a, StackState<'ctx>>,
}

impl<'a, 'ctx> JitSession<'a, 'ctx> {
    pub fn context(&self) -> &'ctx Context {
        self.inner.context
    }

    pub fn target(&self) -> &JitTarget {
        &self.inner.target
    }

    pub fn mangle(&self, name: &str) -> MangledSymbol {
        self.inner.target.mangler().mangle(name)
    }

    fn engine(&self) -> Result<&ExecutionEngine<'ctx>, Error> {
        self.state.engine.as_ref().ok_or_else(disposed_error)
    }

    fn optimize(&self, module: &Module<'ctx>) -> Result<(), Error> {
        let target = &self.inner.target;
        let opt_level = target.config().opt_level.min(3);
        if opt_level == 0 {
            return Ok(());
        }
        module
            .run_passes(
                &format!("default<O{opt_level}>"),
                target.machine(),
                PassBuilderOptions::create(),
            )
            .map_err(|str| orc_error(str.to_string_lossy()))
    }

    /// Add `module` to the stack, taking ownership of it.
    ///
    /// References to functions the module only declares are resolved against
    /// the symbols of the stack first, then against `resolver`, which is
    /// called with the mangled name, and last against the symbols of the
    /// current process. A reference none of them knows fails the addition
    /// with [`ErrorKind::Orc`], and so does a resolver answer that differs
    /// from the address an earlier module was linked against.
    ///
    /// With [`CompilationMode::Eager`] all functions are compiled right away.
    /// With [`CompilationMode::Lazy`] every externally visible function gets
    /// an internal stub and nothing is compiled until one of them is called.
    /// A failed addition leaves no symbols behind.
    pub fn add_module<R>(
        &mut self,
        module: Module<'ctx>,
        mut resolver: R,
        mode: CompilationMode,
    ) -> Result<ModuleHandle, Error>
    where
        R: FnMut(&str) -> Option<usize>,
    {
        let module_name = module.get_name().to_string_lossy().into_owned();
        self.inner.target.configure_module(&module);
        verify(&module)?;
        self.optimize(&module)?;
        let mangler = *self.inner.target.mangler();
        let mut declarations = Vec::new();
        let mut definitions = Vec::new();
        for func in module.get_functions() {
            let ir_name = func.get_name().to_string_lossy().into_owned();
            if ir_name.starts_with("llvm.") {
                continue;
            }
            let symbol = mangler.mangle(&ir_name).to_string();
            if func.as_global_value().is_declaration() {
                declarations.push((func, ir_name, symbol));
            } else if func.get_linkage() == Linkage::External {
                self.check_definable(&symbol, &ir_name)?;
                definitions.push((func, ir_name, symbol));
            }
        }
        let mappings = self.resolve_declarations(&module_name, &declarations, &mut resolver)?;
        {
            let state = &mut *self.state;
            let engine = state.engine.as_ref().ok_or_else(disposed_error)?;
            engine.add_module(&module).map_err(|()| {
                orc_error(format!("module `{module_name}` is owned by another engine"))
            })?;
            for (func, symbol, address) in mappings {
                trace!(%symbol, address, "resolved by symbol resolver");
                engine.add_global_mapping(&func, address);
                state.mapped.insert(symbol, address);
            }
        }
        let handle = ModuleHandle(self.state.next_id());
        let mut entries = Vec::with_capacity(definitions.len());
        let mut stubs = Vec::new();
        if let Err(err) =
            self.prepare_definitions(handle, &definitions, mode, &mut entries, &mut stubs)
        {
            self.discard(&module, stubs);
            if mode == CompilationMode::Eager {
                self.state
                    .retired
                    .extend(definitions.into_iter().map(|(_, ir_name, _)| ir_name));
            }
            return Err(err);
        }
        let symbols = entries
            .iter()
            .map(|(symbol, _)| symbol.clone())
            .collect::<Vec<_>>();
        let ir_names = definitions
            .into_iter()
            .map(|(_, ir_name, _)| ir_name)
            .collect();
        self.state.symbols.extend(entries);
        self.state.stubs.extend(stubs);
        info!(
            module = %module_name,
            handle = handle.0,
            ?mode,
            functions = symbols.len(),
            "added module"
        );
        self.state.modules.insert(
            handle,
            ModuleEntry {
                module,
                symbols,
                ir_names,
            },
        );
        Ok(handle)
    }

    fn check_definable(&self, symbol: &str, ir_name: &str) -> Result<(), Error> {
        if self.state.symbols.contains_key(symbol) {
            return Err(Error::new(
                ErrorKind::DuplicateSymbol,
                format!("symbol `{symbol}` is already defined"),
            ));
        }
        if self.state.retired.contains(ir_name) {
            return Err(Error::new(
                ErrorKind::DuplicateSymbol,
                format!("symbol `{symbol}` was defined by a removed module"),
            ));
        }
        Ok(())
    }

    /// Find an address for every declaration the stack does not define.
    /// Returns the resolver answers that still need a global mapping.
    fn resolve_declarations<R>(
        &self,
        module_name: &str,
        declarations: &[(FunctionValue<'ctx>, String, String)],
        resolver: &mut R,
    ) -> Result<Vec<(FunctionValue<'ctx>, String, usize)>, Error>
    where
        R: FnMut(&str) -> Option<usize>,
    {
        let mut mappings = Vec::new();
        for (func, ir_name, symbol) in declarations {
            if self.state.symbols.contains_key(symbol) {
                trace!(%symbol, "resolved within the jit stack");
                continue;
            }
            if self.state.retired.contains(ir_name) {
                return Err(orc_error(format!(
                    "`{module_name}` refers to `{symbol}` of a removed module"
                )));
            }
            let mapped = self.state.mapped.get(symbol).copied();
            match (resolver(symbol), mapped) {
                (Some(address), Some(mapped)) if address != mapped => {
                    return Err(orc_error(format!(
                        "`{module_name}` resolves `{symbol}` to {address:#x}, but it is already linked to {mapped:#x}"
                    )));
                }
                (_, Some(mapped)) => trace!(%symbol, mapped, "already mapped"),
                (Some(address), None) => mappings.push((*func, symbol.clone(), address)),
                (None, None) => match support::search_for_address_of_symbol(ir_name) {
                    Some(address) => trace!(%symbol, address, "resolved in the process"),
                    None => {
                        return Err(orc_error(format!(
                            "symbol `{symbol}` referenced by `{module_name}` could not be resolved"
                        )));
                    }
                },
            }
        }
        Ok(mappings)
    }

    /// Compile or stub the functions defined by the module `handle`. The new
    /// symbol table entries are collected into `entries` and `stubs` instead
    /// of being inserted.
    fn prepare_definitions(
        &self,
        handle: ModuleHandle,
        definitions: &[(FunctionValue<'ctx>, String, String)],
        mode: CompilationMode,
        entries: &mut Vec<(String, SymbolEntry)>,
        stubs: &mut Vec<(String, StubSlot<'ctx>)>,
    ) -> Result<(), Error> {
        for (func, ir_name, symbol) in definitions {
            let address = match mode {
                CompilationMode::Eager => Some(self.materialize(ir_name)?),
                CompilationMode::Lazy => match Signature::of_function(self.inner.context, *func) {
                    Some(signature) => {
                        let target_name = ir_name.clone();
                        let callback: Arc<LazyCompileFn<'ctx>> =
                            Arc::new(move |session: &mut JitSession<'_, 'ctx>| {
                                session.materialize(&target_name)
                            });
                        // Stub code outlives its module, so stub names are never reused.
                        let stub_name = format!("{ir_name}.lazy.{}", handle.0);
                        let slot = self.build_stub(symbol, &stub_name, &signature, callback)?;
                        stubs.push((symbol.clone(), slot));
                        entries.push((
                            symbol.clone(),
                            SymbolEntry {
                                owner: Some(handle),
                                kind: SymbolKind::Stub,
                            },
                        ));
                        continue;
                    }
                    None => {
                        debug!(%symbol, "no stub for signature, compiled on lookup");
                        None
                    }
                },
            };
            entries.push((
                symbol.clone(),
                SymbolEntry {
                    owner: Some(handle),
                    kind: SymbolKind::Function {
                        ir_name: ir_name.clone(),
                        address,
                    },
                },
            ));
        }
        Ok(())
    }

    /// Take a partially added module and its stubs back out of the engine.
    fn discard(&self, module: &Module<'ctx>, stubs: Vec<(String, StubSlot<'ctx>)>) {
        let Ok(engine) = self.engine() else {
            return;
        };
        for (symbol, slot) in &stubs {
            if let Err(err) = engine.remove_module(&slot.module) {
                warn!(%symbol, ?err, "failed to remove stub module");
            }
        }
        if let Err(err) = engine.remove_module(module) {
            warn!(?err, "failed to remove module");
        }
    }

    /// Compile the function `ir_name` of some added module and return its
    /// address.
    pub(crate) fn materialize(&self, ir_name: &str) -> Result<usize, Error> {
        let address = self
            .engine()?
            .get_function_address(ir_name)
            .map_err(|err| orc_error(format!("failed to compile `{ir_name}`: {err:?}")))?;
        debug!(function = ir_name, address, "compiled function");
        Ok(address)
    }

    /// Register a lazy compile callback that can back any number of stubs.
    pub fn create_lazy_callback<F>(&mut self, callback: F) -> CallbackHandle
    where
        F: Fn(&mut JitSession<'_, 'ctx>) -> Result<usize, Error> + Send + Sync + 'ctx,
    {
        let handle = CallbackHandle(self.state.next_id());
        self.state.callbacks.insert(handle, Arc::new(callback));
        handle
    }

    /// Create a stub named by the mangled `name` that runs `callback` on its
    /// first call and then forwards to the address the callback returned. The
    /// stub's own address can be looked up right away.
    pub fn create_indirect_stub(
        &mut self,
        name: &str,
        signature: &Signature,
        callback: CallbackHandle,
    ) -> Result<(), Error> {
        let ir_name = self.inner.target.mangler().ir_name(name).to_owned();
        self.check_definable(name, &ir_name)?;
        let callback = self
            .state
            .callbacks
            .get(&callback)
            .cloned()
            .ok_or_else(|| orc_error(format!("unknown lazy compile callback {}", callback.0)))?;
        let slot = self.build_stub(name, &ir_name, signature, callback)?;
        self.state.symbols.insert(
            name.to_owned(),
            SymbolEntry {
                owner: None,
                kind: SymbolKind::Stub,
            },
        );
        self.state.stubs.insert(name.to_owned(), slot);
        Ok(())
    }

    fn build_stub(
        &self,
        symbol: &str,
        ir_name: &str,
        signature: &Signature,
        callback: Arc<LazyCompileFn<'ctx>>,
    ) -> Result<StubSlot<'ctx>, Error> {
        let cell = Box::new(StubCell::new(symbol, callback, self.inner));
        let module =
            stub::build_stub_module(self.inner.context, &self.inner.target, ir_name, signature, &cell)?;
        let engine = self.engine()?;
        engine
            .add_module(&module)
            .map_err(|()| orc_error(format!("stub module of `{symbol}` is already owned")))?;
        let address = match engine.get_function_address(ir_name) {
            Ok(address) => address,
            Err(err) => {
                let _ = engine.remove_module(&module);
                return Err(orc_error(format!("failed to compile stub `{symbol}`: {err:?}")));
            }
        };
        debug!(%symbol, address, "created indirect stub");
        Ok(StubSlot {
            cell,
            module,
            address,
        })
    }

    /// Bind the stub `name` to `address` without running its callback. Fails
    /// with [`ErrorKind::StubAlreadyBound`] if the stub forwards somewhere
    /// else already.
    pub fn set_indirect_stub_pointer(&mut self, name: &str, address: usize) -> Result<(), Error> {
        let slot = self.state.stubs.get(name).ok_or_else(|| not_found_error(name))?;
        slot.cell.bind(address)
    }

    /// The address the stub `name` currently forwards to. Fails with
    /// [`ErrorKind::SymbolNotFound`] while the stub is not bound yet.
    pub fn get_stub_pointer(&self, name: &str) -> Result<usize, Error> {
        let slot = self.state.stubs.get(name).ok_or_else(|| not_found_error(name))?;
        slot.cell.bound().ok_or_else(|| {
            Error::new(
                ErrorKind::SymbolNotFound,
                format!("stub `{name}` is not bound yet"),
            )
        })
    }

    /// Look up the address of the mangled symbol `name`. Functions of lazily
    /// added modules resolve to their stubs, and explicit stubs resolve to
    /// themselves, so nothing is compiled by a lookup unless the function has
    /// no stub.
    pub fn get_symbol_address(&mut self, name: &str, scope: SymbolScope) -> Result<usize, Error> {
        if let SymbolScope::InHandle(handle) = scope {
            if !self.state.modules.contains_key(&handle) {
                return Err(handle_error(handle));
            }
        }
        let pending = {
            let entry = self.state.symbols.get(name).ok_or_else(|| not_found_error(name))?;
            if let SymbolScope::InHandle(handle) = scope {
                if entry.owner != Some(handle) {
                    return Err(Error::new(
                        ErrorKind::SymbolNotFound,
                        format!("symbol `{name}` is not defined by module handle {}", handle.0),
                    ));
                }
            }
            match &entry.kind {
                SymbolKind::Function {
                    address: Some(address),
                    ..
                } => return Ok(*address),
                SymbolKind::Function { ir_name, .. } => ir_name.clone(),
                SymbolKind::Stub => {
                    let slot = self.state.stubs.get(name).ok_or_else(|| not_found_error(name))?;
                    return Ok(slot.address);
                }
            }
        };
        let address = self.materialize(&pending)?;
        if let Some(SymbolEntry {
            kind: SymbolKind::Function { address: slot, .. },
            ..
        }) = self.state.symbols.get_mut(name)
        {
            *slot = Some(address);
        }
        Ok(address)
    }

    /// Remove the module behind `handle` together with the stubs created for
    /// it. Lookups through the handle fail with
    /// [`ErrorKind::HandleInvalidated`] afterwards.
    pub fn remove_module(&mut self, handle: ModuleHandle) -> Result<(), Error> {
        let entry = self
            .state
            .modules
            .remove(&handle)
            .ok_or_else(|| handle_error(handle))?;
        let mut stubs = Vec::new();
        for symbol in &entry.symbols {
            self.state.symbols.remove(symbol);
            if let Some(slot) = self.state.stubs.remove(symbol) {
                stubs.push(slot);
            }
        }
        let engine = self.engine()?;
        for slot in &stubs {
            if let Err(err) = engine.remove_module(&slot.module) {
                warn!(symbol = slot.cell.symbol(), ?err, "failed to remove stub module");
            }
        }
        engine
            .remove_module(&entry.module)
            .map_err(|err| orc_error(format!("failed to remove module: {err:?}")))?;
        self.state.retired.extend(entry.ir_names);
        self.state.removed.insert(handle);
        info!(handle = handle.0, "removed module");
        Ok(())
    }

    /// Returns true if `handle` referred to a module that has been removed.
    pub fn is_removed(&self, handle: ModuleHandle) -> bool {
        self.state.removed.contains(&handle)
    }
}

compilation_mode_tests!(eager_tests, CompilationMode::Eager);
compilation_mode_tests!(lazy_tests, CompilationMode::Lazy);

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
    };

    use inkwell::context::Context;
    use proptest::prelude::*;

    use super::testdef::invoke_i32;
    use super::{no_external_symbols, CompilationMode, JitSession, JitStack, SymbolScope};
    use crate::{
        Error, ErrorKind, FactorialModule, JitTarget, ModuleBuilder, Signature, TargetConfig,
        ValueType,
    };

    fn fac_signature() -> Signature {
        Signature::new(&[ValueType::I32], Some(ValueType::I32))
    }

    fn new_stack(context: &Context) -> Result<JitStack<'_>, Error> {
        JitStack::new(context, JitTarget::detect(&TargetConfig::default())?)
    }

    /// Create the stub `fac_stub` whose callback adds the factorial module and
    /// binds the stub to it, counting how often it runs.
    fn fac_stub<'ctx>(
        stack: &JitStack<'ctx>,
        mode: CompilationMode,
        calls: Arc<AtomicUsize>,
    ) -> Result<(), Error> {
        let callback = stack.create_lazy_callback(move |session: &mut JitSession<'_, 'ctx>| {
            calls.fetch_add(1, Ordering::SeqCst);
            let module = FactorialModule::new().build(session.context())?;
            let handle = session.add_module(module, no_external_symbols, mode)?;
            let fac = session.mangle("fac");
            let address = session.get_symbol_address(&fac, SymbolScope::InHandle(handle))?;
            let stub = session.mangle("fac_stub");
            session.set_indirect_stub_pointer(&stub, address)?;
            Ok(address)
        })?;
        stack.create_indirect_stub(&stack.mangle("fac_stub"), &fac_signature(), callback)
    }

    #[test]
    fn stub_compiles_on_first_call() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let calls = Arc::new(AtomicUsize::new(0));
        fac_stub(&stack, CompilationMode::Eager, calls.clone())?;
        let stub = stack.mangle("fac_stub");
        let fac = stack.mangle("fac");
        let stub_address = stack.get_symbol_address(&stub, SymbolScope::Global)?;
        assert_ne!(stub_address, 0);
        assert!(stack.get_stub_pointer(&stub).unwrap_err().is_not_found());
        assert!(stack
            .get_symbol_address(&fac, SymbolScope::Global)
            .unwrap_err()
            .is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(invoke_i32(stub_address, 10)?, 3628800);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let target = stack.get_stub_pointer(&stub)?;
        assert_eq!(target, stack.get_symbol_address(&fac, SymbolScope::Global)?);
        assert_eq!(invoke_i32(stub_address, 5)?, 120);
        assert_eq!(invoke_i32(target, 4)?, 24);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stack.get_stub_pointer(&stub)?, target);
        assert_eq!(stack.get_symbol_address(&stub, SymbolScope::Global)?, stub_address);
        Ok(())
    }

    #[test]
    fn stub_callback_may_add_lazy_module() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let calls = Arc::new(AtomicUsize::new(0));
        fac_stub(&stack, CompilationMode::Lazy, calls.clone())?;
        let stub_address = stack.get_symbol_address(&stack.mangle("fac_stub"), SymbolScope::Global)?;
        assert_eq!(invoke_i32(stub_address, 6)?, 720);
        assert_eq!(invoke_i32(stub_address, 0)?, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn concurrent_first_calls_run_callback_once() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let calls = Arc::new(AtomicUsize::new(0));
        fac_stub(&stack, CompilationMode::Eager, calls.clone())?;
        let stub_address = stack.get_symbol_address(&stack.mangle("fac_stub"), SymbolScope::Global)?;
        let barrier = Barrier::new(8);
        let results = thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        invoke_i32(stub_address, 5)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Result<Vec<_>, Error>>()
        })?;
        assert_eq!(results, [120; 8]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    /// Lets a second thread query the stack while the first one resolves a
    /// stub.
    struct SharedStack<'a, 'ctx>(&'a JitStack<'ctx>);

    // SAFETY: Only the stub pointer is queried, which is guarded by the lock.
    unsafe impl Send for SharedStack<'_, '_> {}
    unsafe impl Sync for SharedStack<'_, '_> {}

    impl SharedStack<'_, '_> {
        fn stub_pointer(&self, name: &str) -> Result<usize, Error> {
            self.0.get_stub_pointer(name)
        }
    }

    #[test]
    fn stub_is_bound_before_lock_is_released() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let module = FactorialModule::new().build(&context)?;
        stack.add_module(module, no_external_symbols, CompilationMode::Eager)?;
        let fac = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
        let barrier = Arc::new(Barrier::new(2));
        let waiting = barrier.clone();
        let callback = stack.create_lazy_callback(move |_| {
            waiting.wait();
            Ok(fac)
        })?;
        let stub = stack.mangle("observed_stub");
        stack.create_indirect_stub(&stub, &fac_signature(), callback)?;
        let stub_address = stack.get_symbol_address(&stub, SymbolScope::Global)?;
        let shared = SharedStack(&stack);
        let (result, observed) = thread::scope(|scope| {
            let observer = scope.spawn(|| {
                barrier.wait();
                shared.stub_pointer(&stub)
            });
            let result = invoke_i32(stub_address, 4);
            (result, observer.join().unwrap())
        });
        assert_eq!(result?, 24);
        assert_eq!(observed?, fac);
        Ok(())
    }

    #[test]
    fn manually_bound_stub_skips_callback() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback = stack.create_lazy_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::new(ErrorKind::Orc, "must not run"))
        })?;
        let stub = stack.mangle("bound_stub");
        stack.create_indirect_stub(&stub, &fac_signature(), callback)?;
        let module = FactorialModule::new().build(&context)?;
        stack.add_module(module, no_external_symbols, CompilationMode::Eager)?;
        let fac = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
        stack.set_indirect_stub_pointer(&stub, fac)?;
        let stub_address = stack.get_symbol_address(&stub, SymbolScope::Global)?;
        assert_eq!(invoke_i32(stub_address, 3)?, 6);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn stub_pointer_can_not_be_rebound() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let callback = stack.create_lazy_callback(|_| Ok(0x1000))?;
        let stub = stack.mangle("pinned_stub");
        stack.create_indirect_stub(&stub, &fac_signature(), callback)?;
        stack.set_indirect_stub_pointer(&stub, 0x1000)?;
        stack.set_indirect_stub_pointer(&stub, 0x1000)?;
        let error = stack.set_indirect_stub_pointer(&stub, 0x2000).unwrap_err();
        assert_eq!(error.kind, ErrorKind::StubAlreadyBound);
        assert_eq!(stack.get_stub_pointer(&stub)?, 0x1000);
        let error = stack.set_indirect_stub_pointer(&stack.mangle("missing"), 0x1000).unwrap_err();
        assert!(error.is_not_found());
        Ok(())
    }

    #[test]
    fn null_stub_pointer_is_rejected() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let callback = stack.create_lazy_callback(|_| Ok(0x1000))?;
        let stub = stack.mangle("null_stub");
        stack.create_indirect_stub(&stub, &fac_signature(), callback)?;
        let error = stack.set_indirect_stub_pointer(&stub, 0).unwrap_err();
        assert_eq!(error.kind, ErrorKind::NullAddress);
        assert!(stack.get_stub_pointer(&stub).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn stub_names_are_unique() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let callback = stack.create_lazy_callback(|_| Ok(0x1000))?;
        let stub = stack.mangle("twice_stub");
        stack.create_indirect_stub(&stub, &fac_signature(), callback)?;
        let error = stack
            .create_indirect_stub(&stub, &fac_signature(), callback)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::DuplicateSymbol);
        Ok(())
    }

    #[test]
    fn unknown_callback_is_rejected() -> Result<(), Error> {
        let context = Context::create();
        let other_context = Context::create();
        let stack = new_stack(&context)?;
        let other = new_stack(&other_context)?;
        other.create_lazy_callback(|_| Ok(0x1000))?;
        let foreign = other.create_lazy_callback(|_| Ok(0x1000))?;
        let error = stack
            .create_indirect_stub(&stack.mangle("foreign_stub"), &fac_signature(), foreign)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Orc);
        Ok(())
    }

    #[test]
    fn lazy_module_compiles_on_first_call() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let module = FactorialModule::new().build(&context)?;
        stack.add_module(module, no_external_symbols, CompilationMode::Lazy)?;
        let fac = stack.mangle("fac");
        assert!(stack.get_stub_pointer(&fac).unwrap_err().is_not_found());
        let address = stack.get_symbol_address(&fac, SymbolScope::Global)?;
        assert!(stack.get_stub_pointer(&fac).unwrap_err().is_not_found());
        assert_eq!(invoke_i32(address, 7)?, 5040);
        let compiled = stack.get_stub_pointer(&fac)?;
        assert_ne!(compiled, address);
        assert_eq!(invoke_i32(compiled, 7)?, 5040);
        Ok(())
    }

    #[test]
    fn dispose_twice_fails() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let module = FactorialModule::new().build(&context)?;
        stack.add_module(module, no_external_symbols, CompilationMode::Eager)?;
        stack.dispose()?;
        assert_eq!(stack.dispose().unwrap_err().kind, ErrorKind::Disposed);
        let error = stack
            .get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Disposed);
        let module = FactorialModule::new().build(&context)?;
        let error = stack
            .add_module(module, no_external_symbols, CompilationMode::Eager)
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Disposed);
        Ok(())
    }

    #[test]
    fn factorial_matches_reference() -> Result<(), Error> {
        let context = Context::create();
        let stack = new_stack(&context)?;
        let module = FactorialModule::new().build(&context)?;
        stack.add_module(module, no_external_symbols, CompilationMode::Eager)?;
        let address = stack.get_symbol_address(&stack.mangle("fac"), SymbolScope::Global)?;
        proptest!(|(n in 0i32..=16)| {
            let expected = (1..=n).fold(1i32, |acc, k| acc.wrapping_mul(k));
            prop_assert_eq!(invoke_i32(address, n).unwrap(), expected);
        });
        Ok(())
    }
}
