use std::{
    fs::{read_to_string, write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::PediaError;

pub const CONFIG_FILE: &str = "pedia.toml";
pub const ENTRYPOINT_FILE: &str = "_all.html";

/// One `idx/*.toml` file: `[index]` with the `name` of an index to declare.
#[derive(Debug, Deserialize)]
struct IndexDeclaration {
    index: IndexHeader,
}

#[derive(Debug, Deserialize)]
struct IndexHeader {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            program: PathBuf::from("tectonopedia-worker"),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Port of the build dashboard.
    pub ui_port: u16,
    /// Port of the web app dev server, reported to dashboard clients.
    pub app_port: u16,
    /// Built dashboard assets.
    pub ui_dist: PathBuf,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            ui_port: 5678,
            app_port: 1234,
            ui_dist: PathBuf::from("serve-ui/dist"),
        }
    }
}

/// Project settings from `pedia.toml`. Relative paths are relative to the
/// project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    #[serde(skip)]
    pub root: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cache_path: PathBuf,
    /// Zero means one worker per available CPU.
    pub n_workers: usize,
    /// Index names accepted in addition to those declared under `index_dir`.
    /// If both are empty, any name is accepted.
    pub indices: Vec<String>,
    /// Directory of `*.toml` index declarations.
    pub index_dir: PathBuf,
    pub watch_dirs: Vec<PathBuf>,
    pub engine: EngineConfig,
    pub serve: ServeConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            root: PathBuf::from("."),
            input_dir: PathBuf::from("txt"),
            output_dir: PathBuf::from("build"),
            cache_path: PathBuf::from("cache/pedia_cache.db"),
            n_workers: 0,
            indices: Vec::new(),
            index_dir: PathBuf::from("idx"),
            watch_dirs: vec![PathBuf::from("cls"), PathBuf::from("idx"), PathBuf::from("txt")],
            engine: EngineConfig::default(),
            serve: ServeConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Load `pedia.toml` from `root`, falling back to defaults when the file
    /// does not exist.
    pub fn load(root: &Path) -> Result<BuildConfig, PediaError> {
        TomlConfigProvider::new(root.join(CONFIG_FILE)).load(root)
    }

    pub fn from_toml_str(root: &Path, text: &str) -> Result<BuildConfig, PediaError> {
        let mut config: BuildConfig = toml::from_str(text)?;
        config.root = root.to_path_buf();
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn input_root(&self) -> PathBuf {
        self.resolve(&self.input_dir)
    }

    pub fn output_root(&self) -> PathBuf {
        self.resolve(&self.output_dir)
    }

    pub fn cache_db(&self) -> PathBuf {
        self.resolve(&self.cache_path)
    }

    /// Scratch space for pass-2 worker output, next to the cache database.
    pub fn scratch_root(&self) -> PathBuf {
        let db = self.cache_db();
        db.parent()
            .map(|p| p.join("scratch"))
            .unwrap_or_else(|| self.root.join("scratch"))
    }

    pub fn index_root(&self) -> PathBuf {
        self.resolve(&self.index_dir)
    }

    /// Every accepted index name: the `indices` list followed by the names
    /// declared in `index_dir/*.toml`, in file name order. A missing index
    /// directory declares nothing.
    pub fn declared_indices(&self) -> Result<Vec<String>, PediaError> {
        let mut names = self.indices.clone();
        let dir = self.index_root();
        if !dir.is_dir() {
            return Ok(names);
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("toml") {
                files.push(path);
            }
        }
        files.sort();
        for path in files {
            let text = read_to_string(&path)?;
            let decl: IndexDeclaration = toml::from_str(&text).map_err(|e| {
                PediaError::Config(format!(
                    "failed to parse index definition file {}: {e}",
                    path.display()
                ))
            })?;
            if !names.contains(&decl.index.name) {
                tracing::debug!("[Config] {} declares index `{}`", path.display(), decl.index.name);
                names.push(decl.index.name);
            }
        }
        Ok(names)
    }

    pub fn ui_dist(&self) -> PathBuf {
        self.resolve(&self.serve.ui_dist)
    }

    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.watch_dirs.iter().map(|d| self.resolve(d)).collect()
    }

    pub fn n_workers(&self) -> usize {
        if self.n_workers > 0 {
            return self.n_workers;
        }
        std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Repository-relative form of `path`, with forward slashes.
    pub fn relative_path(&self, path: &Path) -> Result<String, PediaError> {
        let rel = path.strip_prefix(&self.root)?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn load(&self, root: &Path) -> Result<BuildConfig, PediaError> {
        tracing::debug!("Attempting to read build config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(BuildConfig {
                root: root.to_path_buf(),
                ..BuildConfig::default()
            });
        }
        let content = read_to_string(&self.path)?;
        BuildConfig::from_toml_str(root, &content)
    }

    pub fn save(&self, config: &BuildConfig) -> Result<(), PediaError> {
        tracing::debug!("Attempting to write build config to: {:?}", &self.path);
        write(&self.path, toml::to_string(config)?)?;
        Ok(())
    }
}
