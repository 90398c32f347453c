//! Purpose: Platform loader backends for explicit-path shared-library loading.
//! Exports: `LoaderBackend`, `NativeLoader`, `SymbolScope`, `Residency`, `LoadFailure`, `FailureClass`.
//! Role: The only code that calls OS dynamic-loading primitives; the resolver drives it under a lock.
//! Invariants: Libraries are always opened by full path, never by bare name through search order.
//! Invariants: Handles loaded by `NativeLoader` are retained for the process lifetime and never unloaded.
//! Notes: Residency paths are only known on Linux (link map, then `/proc/self/maps`) or for libraries loaded here.
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use libloading::Library;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolScope {
    /// Exported symbols become visible to libraries loaded later (dependencies).
    Global,
    /// Exported symbols stay private to explicit lookups (plugins).
    Local,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Residency {
    /// Path of the resident copy, when the platform can report it.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// A library the loaded image needs could not be found.
    MissingDependency,
    /// A symbol or symbol version the image imports is not provided by what is resident.
    UnresolvedSymbol,
    /// The file is not a loadable image for this platform/architecture.
    BadImage,
    Other,
}

impl FailureClass {
    pub fn is_dependency_related(self) -> bool {
        matches!(
            self,
            FailureClass::MissingDependency | FailureClass::UnresolvedSymbol
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadFailure {
    pub message: String,
    pub class: FailureClass,
    pub os_code: Option<i32>,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.os_code {
            write!(f, " (os error {code})")?;
        }
        Ok(())
    }
}

impl StdError for LoadFailure {}

/// Platform primitive set the resolver is written against.
pub trait LoaderBackend {
    fn platform(&self) -> &'static str;

    /// Reports whether a library with this logical name is resident in the process.
    fn probe(&self, logical_name: &str) -> Option<Residency>;

    /// Loads `path` by explicit path. Loading a path that is already loaded is a no-op.
    fn load(&self, path: &Path, logical_name: &str, scope: SymbolScope) -> Result<(), LoadFailure>;

    fn has_symbol(&self, path: &Path, symbol: &str) -> bool;
}

/// Loader backed by `dlopen` (unix) or `LoadLibraryExW` (windows).
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeLoader;

struct OwnedLibrary {
    logical_name: String,
    library: Library,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, OwnedLibrary>> {
    static LOADED: OnceLock<Mutex<HashMap<PathBuf, OwnedLibrary>>> = OnceLock::new();
    LOADED.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LoaderBackend for NativeLoader {
    fn platform(&self) -> &'static str {
        std::env::consts::OS
    }

    fn probe(&self, logical_name: &str) -> Option<Residency> {
        // The OS view wins: it is what a later `DT_NEEDED` lookup binds to.
        let resident = platform::probe(logical_name);
        if let Some(Residency { path: Some(_) }) = resident {
            return resident;
        }
        let loaded = registry().lock().unwrap_or_else(PoisonError::into_inner);
        loaded
            .iter()
            .find(|(_, owned)| owned.logical_name == logical_name)
            .map(|(path, _)| Residency {
                path: Some(path.clone()),
            })
            .or(resident)
    }

    fn load(&self, path: &Path, logical_name: &str, scope: SymbolScope) -> Result<(), LoadFailure> {
        let mut loaded = registry().lock().unwrap_or_else(PoisonError::into_inner);
        if loaded.contains_key(path) {
            return Ok(());
        }
        let library = platform::open(path, scope)?;
        loaded.insert(
            path.to_path_buf(),
            OwnedLibrary {
                logical_name: logical_name.to_string(),
                library,
            },
        );
        Ok(())
    }

    fn has_symbol(&self, path: &Path, symbol: &str) -> bool {
        let loaded = registry().lock().unwrap_or_else(PoisonError::into_inner);
        let Some(owned) = loaded.get(path) else {
            return false;
        };
        // SAFETY: The symbol is only resolved, never dereferenced or called.
        unsafe { owned.library.get::<*const std::ffi::c_void>(symbol.as_bytes()) }.is_ok()
    }
}

#[cfg(unix)]
mod platform {
    use std::path::Path;

    use libloading::Library;
    use libloading::os::unix::Library as UnixLibrary;

    use super::{LoadFailure, Residency, SymbolScope, classify_dl_error};

    pub(super) fn open(path: &Path, scope: SymbolScope) -> Result<Library, LoadFailure> {
        let flags = libc::RTLD_NOW
            | match scope {
                SymbolScope::Global => libc::RTLD_GLOBAL,
                SymbolScope::Local => libc::RTLD_LOCAL,
            };
        // SAFETY: Loading runs the library's initializers; callers accept that by asking to load it.
        let library = unsafe { UnixLibrary::open(Some(path), flags) }.map_err(|err| {
            let message = err.to_string();
            LoadFailure {
                class: classify_dl_error(&message, path),
                message,
                os_code: None,
            }
        })?;
        Ok(library.into())
    }

    #[cfg(target_os = "linux")]
    pub(super) fn probe(logical_name: &str) -> Option<Residency> {
        if let Some(path) = link_map::linked_path(logical_name) {
            return Some(Residency { path: Some(path) });
        }
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        super::resident_in_maps(&maps, logical_name).map(|path| Residency { path: Some(path) })
    }

    #[cfg(target_os = "android")]
    pub(super) fn probe(logical_name: &str) -> Option<Residency> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        super::resident_in_maps(&maps, logical_name).map(|path| Residency { path: Some(path) })
    }

    /// Asks the dynamic linker which object answers to a name, the way `DT_NEEDED` lookup does.
    #[cfg(target_os = "linux")]
    mod link_map {
        use std::ffi::{CStr, OsStr, c_char, c_int, c_void};
        use std::os::unix::ffi::OsStrExt;
        use std::path::PathBuf;

        use libloading::os::unix::Library as UnixLibrary;

        const RTLD_DI_LINKMAP: c_int = 2;

        // Leading fields of `struct link_map` from <link.h>.
        #[allow(dead_code)]
        #[repr(C)]
        struct LinkMap {
            l_addr: usize,
            l_name: *const c_char,
            l_ld: *mut c_void,
            l_next: *mut LinkMap,
            l_prev: *mut LinkMap,
        }

        unsafe extern "C" {
            fn dlinfo(handle: *mut c_void, request: c_int, info: *mut c_void) -> c_int;
        }

        pub(super) fn linked_path(name: &str) -> Option<PathBuf> {
            // SAFETY: RTLD_NOLOAD never maps a new image, so no initializers run.
            let library = unsafe {
                UnixLibrary::open(Some(name), libc::RTLD_LAZY | libc::RTLD_NOLOAD)
            }
            .ok()?;
            let handle = library.into_raw();
            let mut map: *mut LinkMap = std::ptr::null_mut();
            // SAFETY: `handle` is live until the drop below; RTLD_DI_LINKMAP writes one pointer.
            let rc = unsafe {
                dlinfo(handle, RTLD_DI_LINKMAP, (&mut map as *mut *mut LinkMap).cast())
            };
            let path = if rc == 0 && !map.is_null() {
                // SAFETY: the link map entry and its name outlive `handle`.
                let raw = unsafe { CStr::from_ptr((*map).l_name) };
                let path = PathBuf::from(OsStr::from_bytes(raw.to_bytes()));
                (!path.as_os_str().is_empty())
                    .then(|| std::fs::canonicalize(&path).unwrap_or(path))
            } else {
                None
            };
            // SAFETY: releases the reference taken by the RTLD_NOLOAD open.
            drop(unsafe { UnixLibrary::from_raw(handle) });
            path
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) fn probe(logical_name: &str) -> Option<Residency> {
        // SAFETY: RTLD_NOLOAD never maps a new image, so no initializers run.
        let handle = unsafe {
            UnixLibrary::open(Some(logical_name), libc::RTLD_LAZY | libc::RTLD_NOLOAD)
        };
        handle.ok().map(|_| Residency { path: None })
    }
}

#[cfg(windows)]
mod platform {
    use std::path::Path;

    use libloading::Library;
    use libloading::os::windows::{LOAD_WITH_ALTERED_SEARCH_PATH, Library as WindowsLibrary};

    use super::{FailureClass, LoadFailure, Residency, SymbolScope};

    const ERROR_MOD_NOT_FOUND: i32 = 126;
    const ERROR_PROC_NOT_FOUND: i32 = 127;
    const ERROR_BAD_EXE_FORMAT: i32 = 193;

    pub(super) fn open(path: &Path, _scope: SymbolScope) -> Result<Library, LoadFailure> {
        // LOAD_WITH_ALTERED_SEARCH_PATH resolves the image's imports from its own directory
        // first instead of the application directory.
        // SAFETY: Loading runs DllMain; callers accept that by asking to load it.
        let library = unsafe { WindowsLibrary::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH) }
            .map_err(|err| {
                let os_code = std::error::Error::source(&err)
                    .and_then(|source| source.downcast_ref::<std::io::Error>())
                    .and_then(std::io::Error::raw_os_error);
                let class = match os_code {
                    Some(ERROR_MOD_NOT_FOUND) => FailureClass::MissingDependency,
                    Some(ERROR_PROC_NOT_FOUND) => FailureClass::UnresolvedSymbol,
                    Some(ERROR_BAD_EXE_FORMAT) => FailureClass::BadImage,
                    _ => FailureClass::Other,
                };
                LoadFailure {
                    message: err.to_string(),
                    class,
                    os_code,
                }
            })?;
        Ok(library.into())
    }

    pub(super) fn probe(logical_name: &str) -> Option<Residency> {
        WindowsLibrary::open_already_loaded(logical_name)
            .ok()
            .map(|_| Residency { path: None })
    }
}

/// Classifies a `dlerror()` message for an attempt to open `path`.
pub fn classify_dl_error(message: &str, path: &Path) -> FailureClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("undefined symbol")
        || lower.contains("symbol not found")
        || lower.contains("symbol lookup error")
        || (lower.contains("version `") && lower.contains("not found"))
    {
        return FailureClass::UnresolvedSymbol;
    }
    if lower.contains("library not loaded") {
        return FailureClass::MissingDependency;
    }
    if lower.contains("invalid elf header")
        || lower.contains("wrong elf class")
        || lower.contains("file too short")
        || lower.contains("not a mach-o file")
        || lower.contains("incompatible architecture")
        || lower.contains("elf load command")
    {
        return FailureClass::BadImage;
    }
    if lower.contains("cannot open shared object file") {
        let subject = message.split(':').next().unwrap_or_default().trim();
        return if Path::new(subject) == path {
            FailureClass::Other
        } else {
            FailureClass::MissingDependency
        };
    }
    FailureClass::Other
}

/// Finds a mapped image whose file name equals `logical_name` in `/proc/<pid>/maps` text.
pub fn resident_in_maps(maps: &str, logical_name: &str) -> Option<PathBuf> {
    maps.lines().find_map(|line| {
        // address perms offset dev inode pathname
        let pathname = line.splitn(6, char::is_whitespace).nth(5)?.trim();
        let pathname = pathname.strip_suffix(" (deleted)").unwrap_or(pathname);
        if !pathname.starts_with('/') {
            return None;
        }
        let path = Path::new(pathname);
        path.file_name()
            .is_some_and(|name| name == logical_name)
            .then(|| path.to_path_buf())
    })
}
