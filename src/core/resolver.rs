//! Purpose: Dependency-before-dependent loading of execution-provider plugins by explicit path.
//! Exports: `LibraryResolver`, `LibraryReference`, `ConflictPolicy`, `LoadOutcome`, `LoadedLibrary`,
//! `PluginLoadReport`, `HOST_PLUGIN_ENTRY_POINTS`.
//! Role: Single coordination point for process-wide loader state; callers never touch OS primitives.
//! Invariants: Every operation holds one process-wide lock for its full duration.
//! Invariants: A failed dependency preload aborts before the plugin is opened.
//! Invariants: No load is ever retried with a different path.
//! Invariants: A logical name already resident from another path is reported, never silently reused.
//! Invariants: Logical names are ELF sonames when present, else the requested file name.
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::image::read_image_names;
use crate::core::loader::{LoaderBackend, NativeLoader, Residency, SymbolScope};

/// Entry points every ONNX Runtime plugin execution-provider library exports.
pub const HOST_PLUGIN_ENTRY_POINTS: [&str; 2] = ["CreateEpFactories", "ReleaseEpFactory"];

static LOAD_LOCK: Mutex<()> = Mutex::new(());

fn load_lock() -> MutexGuard<'static, ()> {
    LOAD_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LibraryReference {
    path: PathBuf,
    logical_name: String,
    needed: Vec<String>,
    dependency: Option<Box<LibraryReference>>,
    required_symbols: Vec<String>,
}

impl LibraryReference {
    /// Canonicalizes `path`; the file must exist and be a regular file.
    ///
    /// The logical name is the image's soname, which is what the OS loader matches other
    /// images' `DT_NEEDED` entries against. Images without one use the file name as given,
    /// before symlinks are resolved.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let requested = path.as_ref();
        let requested_name = requested
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("library path has no file name")
                    .with_path(requested)
            })?;
        let path = std::fs::canonicalize(requested).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::new(ErrorKind::MissingFile)
                    .with_message("library file does not exist")
                    .with_path(requested)
            } else {
                io_error(err, requested).with_message("failed to resolve library path")
            }
        })?;
        if !path.is_file() {
            return Err(Error::new(ErrorKind::MissingFile)
                .with_message("library path is not a regular file")
                .with_path(&path));
        }
        let names = read_image_names(&path)?;
        Ok(Self {
            path,
            logical_name: names.soname.unwrap_or(requested_name),
            needed: names.needed,
            dependency: None,
            required_symbols: Vec::new(),
        })
    }

    /// Declares the single library this one needs resident first.
    pub fn with_dependency(mut self, dependency: LibraryReference) -> Result<Self, Error> {
        if dependency.dependency.is_some() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("only direct dependencies are supported")
                .with_library(&dependency.logical_name)
                .with_path(&dependency.path));
        }
        if dependency.logical_name == self.logical_name {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("a library cannot depend on a library with its own name")
                .with_library(&self.logical_name)
                .with_path(&dependency.path));
        }
        self.dependency = Some(Box::new(dependency));
        Ok(self)
    }

    pub fn require_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.required_symbols.push(symbol.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// `DT_NEEDED` names of the image; empty for non-ELF files.
    pub fn needed(&self) -> &[String] {
        &self.needed
    }

    pub fn dependency(&self) -> Option<&LibraryReference> {
        self.dependency.as_deref()
    }

    pub fn required_symbols(&self) -> &[String] {
        &self.required_symbols
    }
}

/// What to do when a logical name is already resident from a different path.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConflictPolicy {
    #[default]
    Fail,
    /// Load the requested path anyway and report the shadowing.
    Allow,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoadOutcome {
    Loaded,
    AlreadyResident,
    /// Loaded although another copy was already resident; `resident` is its path if known.
    Shadowing { resident: Option<PathBuf> },
}

impl LoadOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LoadOutcome::Loaded => "loaded",
            LoadOutcome::AlreadyResident => "already_resident",
            LoadOutcome::Shadowing { .. } => "shadowing",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadedLibrary {
    pub logical_name: String,
    pub path: PathBuf,
    pub outcome: LoadOutcome,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginLoadReport {
    pub platform: &'static str,
    pub dependency: Option<LoadedLibrary>,
    pub plugin: LoadedLibrary,
}

#[derive(Clone, Copy)]
enum Role {
    Dependency,
    Plugin,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Dependency => "dependency",
            Role::Plugin => "plugin",
        }
    }

    fn scope(self) -> SymbolScope {
        match self {
            Role::Dependency => SymbolScope::Global,
            Role::Plugin => SymbolScope::Local,
        }
    }
}

pub struct LibraryResolver<B: LoaderBackend = NativeLoader> {
    backend: B,
    policy: ConflictPolicy,
    plugin_symbols: Vec<String>,
    dependency_symbols: Vec<String>,
}

impl LibraryResolver<NativeLoader> {
    pub fn native() -> Self {
        Self::new(NativeLoader)
    }
}

impl<B: LoaderBackend> LibraryResolver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            policy: ConflictPolicy::default(),
            plugin_symbols: Vec::new(),
            dependency_symbols: Vec::new(),
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Symbols every plugin loaded through this resolver must export.
    pub fn require_plugin_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.plugin_symbols.push(symbol.into());
        self
    }

    pub fn require_dependency_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.dependency_symbols.push(symbol.into());
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn probe(&self, logical_name: &str) -> Option<Residency> {
        let _guard = load_lock();
        self.backend.probe(logical_name)
    }

    /// Makes `dependency_path` resident by explicit path with globally visible symbols.
    pub fn preload_dependency(
        &self,
        dependency_path: impl AsRef<Path>,
    ) -> Result<LoadedLibrary, Error> {
        let reference = LibraryReference::new(dependency_path)
            .map_err(|err| err.with_role(Role::Dependency.as_str()))?;
        let _guard = load_lock();
        self.load_locked(&reference, Role::Dependency)
    }

    pub fn resolve_and_load_plugin(
        &self,
        plugin_path: impl AsRef<Path>,
        dependency_path: Option<&Path>,
    ) -> Result<PluginLoadReport, Error> {
        let mut plugin = LibraryReference::new(plugin_path)
            .map_err(|err| err.with_role(Role::Plugin.as_str()))?;
        if let Some(dependency_path) = dependency_path {
            let dependency = LibraryReference::new(dependency_path)
                .map_err(|err| err.with_role(Role::Dependency.as_str()))?;
            plugin = plugin.with_dependency(dependency)?;
        }
        self.load_reference(&plugin)
    }

    /// Loads `plugin` after its declared dependency, if any.
    pub fn load_reference(&self, plugin: &LibraryReference) -> Result<PluginLoadReport, Error> {
        let _guard = load_lock();
        let dependency = match plugin.dependency() {
            Some(dependency) => Some(self.load_locked(dependency, Role::Dependency)?),
            None => None,
        };
        let loaded = self.load_locked(plugin, Role::Plugin).map_err(|err| {
            if err.kind() == ErrorKind::DependencyOrder && err.hint().is_none() {
                let hint = match plugin.dependency() {
                    Some(dependency) => format!(
                        "The preloaded {} at {} does not satisfy the plugin; supply the matching version.",
                        dependency.logical_name(),
                        dependency.path().display()
                    ),
                    None => "Preload the host library the plugin was built against (--dependency <path>)."
                        .to_string(),
                };
                err.with_hint(hint)
            } else {
                err
            }
        })?;
        if let (Some(declared), Some(preloaded)) = (plugin.dependency(), dependency.as_ref()) {
            self.verify_binding(plugin, declared, preloaded)?;
        }
        Ok(PluginLoadReport {
            platform: self.backend.platform(),
            dependency,
            plugin: loaded,
        })
    }

    /// Checks that the name the plugin needs resolves to the preloaded dependency.
    fn verify_binding(
        &self,
        plugin: &LibraryReference,
        declared: &LibraryReference,
        preloaded: &LoadedLibrary,
    ) -> Result<(), Error> {
        let name = declared.logical_name();
        if matches!(preloaded.outcome, LoadOutcome::Shadowing { .. })
            || !plugin.needed().iter().any(|needed| needed == name)
        {
            return Ok(());
        }
        match self.backend.probe(name) {
            Some(Residency {
                path: Some(bound),
            }) if bound != declared.path() => {
                tracing::error!(
                    library = name,
                    bound = %bound.display(),
                    expected = %declared.path().display(),
                    "plugin bound to another copy of its dependency"
                );
                Err(Error::new(ErrorKind::DependencyOrder)
                    .with_message(format!(
                        "plugin resolved {name} to {} instead of the preloaded {}",
                        bound.display(),
                        declared.path().display()
                    ))
                    .with_hint("Another copy with the same soname won the lookup; load the dependency before anything else pulls it in.")
                    .with_role(Role::Plugin.as_str())
                    .with_library(plugin.logical_name())
                    .with_path(plugin.path()))
            }
            _ => Ok(()),
        }
    }

    fn load_locked(&self, reference: &LibraryReference, role: Role) -> Result<LoadedLibrary, Error> {
        let name = reference.logical_name();
        let path = reference.path();
        let context = |err: Error| {
            err.with_role(role.as_str())
                .with_library(name)
                .with_path(path)
        };

        let outcome = match self.backend.probe(name) {
            None => LoadOutcome::Loaded,
            Some(Residency {
                path: Some(resident),
            }) if resident == path => LoadOutcome::AlreadyResident,
            Some(Residency { path: resident }) => match self.policy {
                ConflictPolicy::Fail => {
                    let shown = resident
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "an unknown path".to_string());
                    return Err(context(
                        Error::new(ErrorKind::DependencyOrder)
                            .with_message(format!("{name} is already resident from {shown}"))
                            .with_hint(
                                "Another component loaded a different copy first; load this library earlier or allow shadowing explicitly.",
                            ),
                    ));
                }
                ConflictPolicy::Allow => {
                    tracing::warn!(
                        library = name,
                        path = %path.display(),
                        resident = ?resident,
                        "loading over an already-resident copy"
                    );
                    LoadOutcome::Shadowing { resident }
                }
            },
        };

        if outcome != LoadOutcome::AlreadyResident {
            tracing::debug!(library = name, path = %path.display(), role = role.as_str(), "loading by explicit path");
            self.backend.load(path, name, role.scope()).map_err(|failure| {
                let kind = match role {
                    Role::Plugin if failure.class.is_dependency_related() => ErrorKind::DependencyOrder,
                    _ => ErrorKind::LibraryLoad,
                };
                context(
                    Error::new(kind)
                        .with_message(format!("failed to load {}: {}", role.as_str(), failure.message))
                        .with_source(failure),
                )
            })?;
        }

        let extra = match role {
            Role::Plugin => &self.plugin_symbols,
            Role::Dependency => &self.dependency_symbols,
        };
        for symbol in reference.required_symbols().iter().chain(extra) {
            if !self.backend.has_symbol(path, symbol) {
                return Err(context(
                    Error::new(ErrorKind::LibraryLoad)
                        .with_message(format!("{} does not export required symbol {symbol}", role.as_str())),
                ));
            }
        }

        tracing::info!(library = name, path = %path.display(), outcome = outcome.label(), "library resident");
        Ok(LoadedLibrary {
            logical_name: name.to_string(),
            path: path.to_path_buf(),
            outcome,
        })
    }
}
