//! ScryBridge: a bridge between native Rust code and an embedded Python runtime.
//!
//! Host code creates a [`Context`], registers native closures, function
//! groups and properties into its global namespace, runs script source, and
//! calls script functions with native values. Script code calls back into
//! native closures and native-object methods through wrapper classes.
//!
//! - [`value`]: the native value model ([`Value`], [`NativeFunction`], [`NativeObject`])
//! - [`convert`]: conversion between [`Value`]s and script values
//! - [`wrapper`]: the script classes backing native entities
//! - [`registry`]: script objects associated with native instances
//! - [`context`]: execution contexts and the call protocol
//! - [`loader`]: script discovery on disk
//! - [`error`]: structured errors and the thread-local last error

pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod loader;
pub mod registry;
pub mod script_value;
pub mod value;
pub mod wrapper;

pub use config::ContextConfig;
pub use context::{Call, Context, ContextState};
pub use convert::Converter;
pub use error::{clear_last_error, last_error, take_last_error, BridgeError, BridgeResult};
pub use loader::{LoadedScript, ScriptDirectories, ScriptLoader};
pub use registry::{attach, detach, invoke_on_self, lookup, Association};
pub use script_value::{ScriptKind, ScriptValue};
pub use value::{FunctionTable, NativeFunction, NativeObject, Opaque, Point, Scriptable, Value, ValueKind};
