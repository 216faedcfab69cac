//! Interpreter configuration.
//!
//! Everything here is captured into generated code at generation time
//! (as immediates or as addresses of VM globals) and cannot change
//! afterwards without regenerating the interpreter.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Code generation backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Portable ISA executed by the built-in simulator
    #[default]
    Portable,
    /// x86-64 machine code (generation and listing only)
    #[serde(rename = "x86-64")]
    X86_64,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Portable => "portable",
            Backend::X86_64 => "x86-64",
        }
    }
}

/// Write barrier flavour required by the collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcBarrier {
    #[default]
    None,
    /// Snapshot-at-the-beginning: log the previous value of reference
    /// stores and of `Reference.get` reads while marking is active.
    Satb,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Interpreter and runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub backend: Backend,
    /// Collect branch profiles in a method data block once a method is warm
    pub profile_interpreter: bool,
    /// Tiered counters: notify every 2^freq_log events instead of comparing
    /// against a fixed threshold
    pub tiered_compilation: bool,
    /// Math and `Reference.get` entries
    pub use_intrinsics: bool,
    pub use_fast_accessor_methods: bool,
    pub use_fast_empty_methods: bool,
    /// Method entry/exit notification, pop frame and early return
    pub jvmti_support: bool,
    /// Check frame invariants on every dispatch
    pub verify_stack: bool,
    /// Java stack size per thread in bytes
    pub stack_size: usize,
    pub stack_red_pages: usize,
    pub stack_yellow_pages: usize,
    pub stack_shadow_pages: usize,
    /// Invocations (plus backedges) before a compile request, non-tiered
    pub compile_threshold: u32,
    /// Backedges before an OSR request, non-tiered
    pub backedge_threshold: u32,
    /// Percentage of `compile_threshold` after which profiling starts
    pub interpreter_profile_percentage: u32,
    pub tier0_invoke_notify_freq_log: u32,
    pub tier0_backedge_notify_freq_log: u32,
    pub gc_barrier: GcBarrier,
    /// Interpreter code region size in bytes (0 = derived estimate)
    pub code_cache_size: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Portable,
            profile_interpreter: true,
            tiered_compilation: false,
            use_intrinsics: true,
            use_fast_accessor_methods: true,
            use_fast_empty_methods: true,
            jvmti_support: true,
            verify_stack: cfg!(debug_assertions),
            stack_size: 1024 * 1024,
            stack_red_pages: 1,
            stack_yellow_pages: 2,
            stack_shadow_pages: 4,
            compile_threshold: 10000,
            backedge_threshold: 14000,
            interpreter_profile_percentage: 33,
            tier0_invoke_notify_freq_log: 7,
            tier0_backedge_notify_freq_log: 10,
            gc_barrier: GcBarrier::None,
            code_cache_size: 0,
        }
    }
}

/// Unit of the stack guard zones.
pub const STACK_PAGE_SIZE: usize = 4096;

impl InterpreterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: InterpreterConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zones = self.stack_red_pages + self.stack_yellow_pages + self.stack_shadow_pages;
        if self.stack_size == 0 || self.stack_size % STACK_PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid(format!(
                "stack_size must be a non-zero multiple of {}",
                STACK_PAGE_SIZE
            )));
        }
        if self.stack_red_pages == 0 {
            return Err(ConfigError::Invalid("stack_red_pages must be at least 1".into()));
        }
        if (zones + 1) * STACK_PAGE_SIZE > self.stack_size {
            return Err(ConfigError::Invalid(
                "stack guard zones leave no usable stack".into(),
            ));
        }
        if self.compile_threshold == 0 || self.compile_threshold >= (1 << 28) {
            return Err(ConfigError::Invalid(
                "compile_threshold must be in 1..2^28".into(),
            ));
        }
        if self.backedge_threshold == 0 || self.backedge_threshold >= (1 << 28) {
            return Err(ConfigError::Invalid(
                "backedge_threshold must be in 1..2^28".into(),
            ));
        }
        if self.interpreter_profile_percentage > 100 {
            return Err(ConfigError::Invalid(
                "interpreter_profile_percentage must be at most 100".into(),
            ));
        }
        for (name, log) in [
            ("tier0_invoke_notify_freq_log", self.tier0_invoke_notify_freq_log),
            ("tier0_backedge_notify_freq_log", self.tier0_backedge_notify_freq_log),
        ] {
            if log > 30 {
                return Err(ConfigError::Invalid(format!("{} must be at most 30", name)));
            }
        }
        Ok(())
    }

    /// Invocation count after which a method data block is created.
    pub fn profile_limit(&self) -> u32 {
        (self.compile_threshold as u64 * self.interpreter_profile_percentage as u64 / 100) as u32
    }

    /// Size of the interpreter code region.
    pub fn code_region_size(&self) -> usize {
        if self.code_cache_size != 0 {
            return self.code_cache_size;
        }
        let mut size = 512 * 1024;
        if self.profile_interpreter {
            size += 128 * 1024;
        }
        if self.jvmti_support {
            size += 128 * 1024;
        }
        if self.verify_stack {
            size += 128 * 1024;
        }
        if self.backend == Backend::X86_64 {
            size *= 2;
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        InterpreterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = InterpreterConfig::from_toml_str(
            r#"
            backend = "x86-64"
            tiered_compilation = true
            gc_barrier = "satb"
            compile_threshold = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::X86_64);
        assert!(config.tiered_compilation);
        assert_eq!(config.gc_barrier, GcBarrier::Satb);
        assert_eq!(config.compile_threshold, 50);
        assert_eq!(config.stack_size, InterpreterConfig::default().stack_size);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = InterpreterConfig {
            tier0_invoke_notify_freq_log: 31,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = InterpreterConfig {
            stack_size: 8192,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        assert!(InterpreterConfig::from_toml_str("compile_threshold = 0").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = InterpreterConfig {
            use_intrinsics: false,
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(InterpreterConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_profile_limit() {
        let config = InterpreterConfig {
            compile_threshold: 300,
            interpreter_profile_percentage: 10,
            ..Default::default()
        };
        assert_eq!(config.profile_limit(), 30);
    }
}
