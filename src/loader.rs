//! Script discovery on disk.
//!
//! Scripts are looked up by name in an override directory first and then in
//! a packaged directory; the first hit wins. Listing merges both locations,
//! with override entries shadowing packaged ones of the same name.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::ContextConfig;
use crate::error::{BridgeError, BridgeResult};

/// Source text of a resolved script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedScript {
    pub name: String,
    pub path: PathBuf,
    pub source: String,
}

/// Where a context gets script source from.
pub trait ScriptLoader {
    /// Find `name`, or fail with [`BridgeError::ScriptNotFound`].
    fn resolve(&self, name: &str) -> BridgeResult<LoadedScript>;

    /// Every script name that `resolve` would find.
    fn list_available(&self) -> BridgeResult<BTreeSet<String>>;
}

/// Override-then-packaged directory search.
#[derive(Debug, Clone, Default)]
pub struct ScriptDirectories {
    override_dir: Option<PathBuf>,
    packaged_dir: Option<PathBuf>,
    prefix: Option<String>,
    extension: String,
}

impl ScriptDirectories {
    pub fn new(override_dir: Option<PathBuf>, packaged_dir: Option<PathBuf>) -> Self {
        ScriptDirectories {
            override_dir,
            packaged_dir,
            prefix: None,
            extension: "py".to_string(),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        ScriptDirectories {
            override_dir: config.override_dir.clone(),
            packaged_dir: config.packaged_dir.clone(),
            prefix: config.search_prefix.clone(),
            extension: config.script_extension.clone(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Search roots in precedence order.
    fn roots(&self) -> Vec<PathBuf> {
        [&self.override_dir, &self.packaged_dir]
            .into_iter()
            .flatten()
            .map(|dir| match &self.prefix {
                Some(prefix) => dir.join(prefix),
                None => dir.clone(),
            })
            .collect()
    }

    fn file_name(&self, name: &str) -> String {
        let suffix = format!(".{}", self.extension);
        if name.ends_with(&suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        }
    }

    fn script_name(&self, path: &Path) -> Option<String> {
        if !path.is_file() {
            return None;
        }
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        path.file_stem()?.to_str().map(str::to_owned)
    }
}

impl ScriptLoader for ScriptDirectories {
    fn resolve(&self, name: &str) -> BridgeResult<LoadedScript> {
        let file_name = self.file_name(name);
        for root in self.roots() {
            let path = root.join(&file_name);
            match fs::read_to_string(&path) {
                Ok(source) => {
                    return Ok(LoadedScript {
                        name: name.to_string(),
                        path,
                        source,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(BridgeError::ScriptNotFound(name.to_string()))
    }

    fn list_available(&self) -> BridgeResult<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for root in self.roots() {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                if let Some(name) = self.script_name(&entry?.path()) {
                    names.insert(name);
                }
            }
        }
        Ok(names)
    }
}

impl fmt::Display for ScriptDirectories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roots: Vec<String> = self.roots().iter().map(|r| r.display().to_string()).collect();
        write!(f, "[{}]", roots.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn override_directory_wins() {
        let overrides = TempDir::new().unwrap();
        let packaged = TempDir::new().unwrap();
        write(overrides.path(), "main.py", "x = 'override'");
        write(packaged.path(), "main.py", "x = 'packaged'");
        write(packaged.path(), "extra.py", "y = 1");

        let loader = ScriptDirectories::new(
            Some(overrides.path().to_path_buf()),
            Some(packaged.path().to_path_buf()),
        );
        let main = loader.resolve("main").unwrap();
        assert_eq!(main.source, "x = 'override'");
        assert_eq!(main.path, overrides.path().join("main.py"));

        let extra = loader.resolve("extra.py").unwrap();
        assert_eq!(extra.source, "y = 1");
    }

    #[test]
    fn listing_merges_both_locations() {
        let overrides = TempDir::new().unwrap();
        let packaged = TempDir::new().unwrap();
        write(overrides.path(), "a.py", "");
        write(overrides.path(), "notes.txt", "");
        write(packaged.path(), "a.py", "");
        write(packaged.path(), "b.py", "");

        let loader = ScriptDirectories::new(
            Some(overrides.path().to_path_buf()),
            Some(packaged.path().to_path_buf()),
        );
        let names: Vec<String> = loader.list_available().unwrap().into_iter().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn prefix_and_missing_directories() {
        let packaged = TempDir::new().unwrap();
        write(&packaged.path().join("scripts"), "boot.py", "1");

        let loader = ScriptDirectories::new(
            Some(packaged.path().join("does-not-exist")),
            Some(packaged.path().to_path_buf()),
        )
        .with_prefix("scripts");
        assert_eq!(loader.resolve("boot").unwrap().source, "1");
        assert_eq!(loader.list_available().unwrap().len(), 1);
        assert_eq!(
            loader.resolve("absent"),
            Err(BridgeError::ScriptNotFound("absent".into()))
        );
    }
}
