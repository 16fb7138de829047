/// Knobs that change how tolerant the interpreter is of real-world firmware. The defaults match what most
/// firmware is tested against.
#[derive(Clone, Debug)]
pub struct Config {
    /// Keep an owned copy of the DSDT instead of referring to the host's mapping of it.
    pub copy_dsdt_locally: bool,
    /// Tolerate reads of uninitialized locals and arguments, and return the value of the last statement from
    /// methods that end without a `Return`.
    pub enable_interpreter_slack: bool,
    /// Allow declarations in later tables (and in methods) to replace existing namespace nodes.
    pub runtime_namespace_override: bool,
    /// Use the 32-bit `DSDT` address in the FADT even if the 64-bit `X_DSDT` is present.
    pub do_not_use_xsdt: bool,
    /// Methods that end without a `Return` produce `Integer(0)`.
    pub implicit_return: bool,
    /// Reject `Scope` operators that target integers, strings, or buffers, instead of retyping the target.
    pub strict_scope_retyping: bool,
    /// Refuse to load tables on platforms whose FADT does not declare them hardware-reduced.
    pub require_hardware_reduced: bool,
    pub max_loop_iterations: u32,
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            copy_dsdt_locally: false,
            enable_interpreter_slack: false,
            runtime_namespace_override: false,
            do_not_use_xsdt: false,
            implicit_return: true,
            strict_scope_retyping: false,
            require_hardware_reduced: cfg!(target_arch = "riscv64"),
            max_loop_iterations: 0xffff,
            max_call_depth: 256,
        }
    }
}
