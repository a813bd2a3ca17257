//! Host target discovery and target machine construction.

use std::{fmt, ops::Deref, sync::OnceLock};

use inkwell::{
    module::Module,
    support,
    targets::{
        CodeModel, InitializationConfig, RelocMode, Target, TargetData, TargetMachine,
        TargetTriple,
    },
    OptimizationLevel,
};
use tracing::{debug, info};

use crate::{Error, ErrorKind};

/// Settings used to construct the target machine the JIT generates code for.
#[derive(Clone, Debug)]
pub struct TargetConfig {
    /// Target triple to use instead of the host default.
    pub triple: Option<String>,
    /// CPU name. Empty selects the default for the triple.
    pub cpu: String,
    /// Feature string. Empty selects the default for the triple.
    pub features: String,
    /// Optimization level between 0 and 3. Larger values are treated as 3.
    pub opt_level: u32,
    pub reloc_mode: RelocMode,
    pub code_model: CodeModel,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            triple: None,
            cpu: String::new(),
            features: String::new(),
            opt_level: 3,
            reloc_mode: RelocMode::Default,
            code_model: CodeModel::JITDefault,
        }
    }
}

impl TargetConfig {
    pub fn optimization_level(&self) -> OptimizationLevel {
        match self.opt_level {
            0 => OptimizationLevel::None,
            1 => OptimizationLevel::Less,
            2 => OptimizationLevel::Default,
            _ => OptimizationLevel::Aggressive,
        }
    }
}

static NATIVE_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize the native target together with its assembly printer and
/// parser, and make the symbols of the current process searchable. Only the
/// first call performs the initialization, later calls return its outcome.
pub fn initialize_once() -> Result<(), Error> {
    NATIVE_INIT
        .get_or_init(|| {
            debug!("initializing native target");
            Target::initialize_native(&InitializationConfig::default())?;
            support::load_visible_symbols();
            Ok(())
        })
        .clone()
        .map_err(|str| Error::new(ErrorKind::TargetInit, str))
}

/// Immutable description of a resolved target.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TargetDescriptor {
    pub triple: String,
    pub name: String,
    pub description: String,
    pub has_jit: bool,
    pub has_target_machine: bool,
    pub has_asm_backend: bool,
}

impl TargetDescriptor {
    fn of(target: &Target, triple: &TargetTriple) -> Self {
        TargetDescriptor {
            triple: triple.as_str().to_string_lossy().into_owned(),
            name: target.get_name().to_string_lossy().into_owned(),
            description: target.get_description().to_string_lossy().into_owned(),
            has_jit: target.has_jit(),
            has_target_machine: target.has_target_machine(),
            has_asm_backend: target.has_asm_backend(),
        }
    }
}

/// Fail with [`ErrorKind::JitUnsupported`] if the described target can not
/// be used for JIT compilation.
pub fn require_jit(descriptor: &TargetDescriptor) -> Result<(), Error> {
    if descriptor.has_jit {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::JitUnsupported,
            format!("cannot do jit for `{}`", descriptor.triple),
        ))
    }
}

/// A target machine known to support JIT compilation.
pub struct JitTarget {
    descriptor: TargetDescriptor,
    config: TargetConfig,
    machine: TargetMachine,
    mangler: Mangler,
}

impl JitTarget {
    /// Resolve the target selected by `config` and construct a target machine
    /// for it. No target machine is created for targets without JIT support.
    pub fn detect(config: &TargetConfig) -> Result<Self, Error> {
        initialize_once()?;
        let triple = match &config.triple {
            Some(triple) => TargetTriple::create(triple),
            None => TargetMachine::get_default_triple(),
        };
        let target = Target::from_triple(&triple)
            .map_err(|str| Error::new(ErrorKind::TripleUnresolvable, str))?;
        let descriptor = TargetDescriptor::of(&target, &triple);
        require_jit(&descriptor)?;
        let machine = target
            .create_target_machine(
                &triple,
                &config.cpu,
                &config.features,
                config.optimization_level(),
                config.reloc_mode,
                config.code_model,
            )
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::TargetMachine,
                    format!("failed to create target machine for `{}`", descriptor.triple),
                )
            })?;
        let data_layout = machine.get_target_data().get_data_layout();
        let mangler = Mangler::from_data_layout(&data_layout.as_str().to_string_lossy());
        info!(
            triple = %descriptor.triple,
            target = %descriptor.name,
            opt_level = config.opt_level,
            "created jit target machine"
        );
        Ok(JitTarget {
            descriptor,
            config: config.clone(),
            machine,
            mangler,
        })
    }

    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn machine(&self) -> &TargetMachine {
        &self.machine
    }

    pub fn mangler(&self) -> &Mangler {
        &self.mangler
    }

    pub fn target_data(&self) -> TargetData {
        self.machine.get_target_data()
    }

    pub fn data_layout(&self) -> String {
        self.target_data()
            .get_data_layout()
            .as_str()
            .to_string_lossy()
            .into_owned()
    }

    pub fn optimization_level(&self) -> OptimizationLevel {
        self.config.optimization_level()
    }

    /// Set the triple and data layout of `module` to the ones of this target.
    pub fn configure_module(&self, module: &Module) {
        module.set_triple(&self.machine.get_triple());
        module.set_data_layout(&self.target_data().get_data_layout());
    }
}

/// Derives linkage names from logical names for one target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mangler {
    global_prefix: Option<char>,
}

impl Mangler {
    /// Use the mangling mode (`m:`) of the given data layout string. Mach-O
    /// and 32-bit Windows COFF prefix global symbols with an underscore.
    pub fn from_data_layout(layout: &str) -> Self {
        let mode = layout
            .split('-')
            .find_map(|part| part.strip_prefix("m:"))
            .and_then(|mode| mode.chars().next());
        Mangler {
            global_prefix: match mode {
                Some('o') | Some('x') => Some('_'),
                _ => None,
            },
        }
    }

    pub fn mangle(&self, name: &str) -> MangledSymbol {
        match self.global_prefix {
            Some(prefix) => MangledSymbol(format!("{prefix}{name}")),
            None => MangledSymbol(name.to_owned()),
        }
    }

    /// The IR name that mangles to `symbol`.
    pub fn ir_name<'a>(&self, symbol: &'a str) -> &'a str {
        match self.global_prefix {
            Some(prefix) => symbol.strip_prefix(prefix).unwrap_or(symbol),
            None => symbol,
        }
    }
}

/// A linkage name as it appears in the generated object code.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MangledSymbol(String);

impl MangledSymbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for MangledSymbol {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MangledSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
