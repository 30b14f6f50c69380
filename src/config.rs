//! Context configuration.
//!
//! Everything here is consumed once, when a context is activated, except the
//! script-loading settings which are read on every load.

use std::path::PathBuf;

/// Settings for a [`Context`](crate::Context).
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Writable location searched first when loading scripts by name.
    pub override_dir: Option<PathBuf>,

    /// Read-only location with the scripts shipped alongside the host.
    pub packaged_dir: Option<PathBuf>,

    /// Sub-directory applied under both script locations.
    pub search_prefix: Option<String>,

    /// Extension appended to script names that lack one.
    pub script_extension: String,

    /// Prepended to `sys.path` at activation so scripts can `import` helpers.
    pub module_paths: Vec<PathBuf>,

    /// Install the core helpers (`p(x, y)`) at activation.
    pub load_prelude: bool,

    /// File name reported in tracebacks for evaluated source strings.
    pub source_name: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            override_dir: None,
            packaged_dir: None,
            search_prefix: None,
            script_extension: "py".to_string(),
            module_paths: Vec::new(),
            load_prelude: true,
            source_name: "<script>".to_string(),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    pub fn with_packaged_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.packaged_dir = Some(dir.into());
        self
    }

    pub fn with_search_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.search_prefix = Some(prefix.into());
        self
    }

    pub fn with_script_extension(mut self, extension: impl Into<String>) -> Self {
        self.script_extension = extension.into();
        self
    }

    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_paths.push(path.into());
        self
    }

    pub fn without_prelude(mut self) -> Self {
        self.load_prelude = false;
        self
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }
}
