//! Purpose: Assemble plugin packages from validated source files with all-or-nothing semantics.
//! Exports: `PackageBuilder`, `PackageLayout`, `PackageManifest`, `ManifestEntry`, `BuiltPackage`,
//! `Role`, `FileCopier`, `FsCopier`.
//! Role: Stage binaries, resources, and generated fixtures, then move the package into place.
//! Invariants: `add_*` never writes; all filesystem effects happen in `build`.
//! Invariants: A failed build leaves the destination absent or exactly as it was before.
//! Invariants: The dependency binary lands next to the plugin binary (`libs/`).
use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::artifact::{self, REFERENCE_FILE_NAME};
use crate::core::error::{Error, ErrorKind, io_error};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    PrimaryPlugin,
    Dependency,
    Resource,
    TestModel,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::PrimaryPlugin => "primary_plugin",
            Role::Dependency => "dependency",
            Role::Resource => "resource",
            Role::TestModel => "test_model",
        }
    }

    fn directory(&self) -> &'static str {
        match self {
            Role::PrimaryPlugin | Role::Dependency => "libs",
            Role::Resource => "resources",
            Role::TestModel => "testdata",
        }
    }

    fn is_singular(&self) -> bool {
        !matches!(self, Role::Resource)
    }
}

/// Copies one file; the seam where tests inject disk faults.
pub trait FileCopier {
    fn copy(&mut self, source: &Path, destination: &Path) -> io::Result<u64>;
}

/// Copies contents and access/modification times, then permissions.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsCopier;

impl FileCopier for FsCopier {
    fn copy(&mut self, source: &Path, destination: &Path) -> io::Result<u64> {
        let metadata = fs::metadata(source)?;
        let mut reader = File::open(source)?;
        let mut writer = File::create(destination)?;
        let bytes = io::copy(&mut reader, &mut writer)?;
        writer.sync_all()?;

        let mut times = FileTimes::new().set_modified(metadata.modified()?);
        if let Ok(accessed) = metadata.accessed() {
            times = times.set_accessed(accessed);
        }
        writer.set_times(times)?;
        drop(writer);

        // Last, so read-only sources don't block the writes above.
        fs::set_permissions(destination, metadata.permissions())?;
        Ok(bytes)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Source {
    File(PathBuf),
    ReferenceModel,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct PendingEntry {
    role: Role,
    source: Source,
    relative: PathBuf,
}

/// Role → destination-relative path mapping for one package.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackageLayout {
    pub name: String,
    pub entries: Vec<(Role, PathBuf)>,
}

impl PackageLayout {
    pub fn path_for(&self, role: &Role) -> Option<&Path> {
        self.entries
            .iter()
            .find(|(entry_role, _)| entry_role == role)
            .map(|(_, path)| path.as_path())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub role: Role,
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PackageManifest {
    pub schema: u32,
    pub name: String,
    pub version: String,
    pub platform: String,
    pub entries: Vec<ManifestEntry>,
}

impl PackageManifest {
    /// Role → relative destination path, multi-valued for resources.
    pub fn paths_by_role(&self) -> BTreeMap<Role, Vec<String>> {
        let mut map: BTreeMap<Role, Vec<String>> = BTreeMap::new();
        for entry in &self.entries {
            map.entry(entry.role.clone()).or_default().push(entry.path.clone());
        }
        map
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuiltPackage {
    pub root: PathBuf,
    pub layout: PackageLayout,
    pub manifest: PackageManifest,
}

pub struct PackageBuilder<C: FileCopier = FsCopier> {
    name: String,
    version: String,
    required: Vec<Role>,
    pending: Vec<PendingEntry>,
    copier: C,
}

impl PackageBuilder<FsCopier> {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        Self::with_copier(name, FsCopier)
    }
}

impl<C: FileCopier> PackageBuilder<C> {
    pub fn with_copier(name: impl Into<String>, copier: C) -> Result<Self, Error> {
        let name = name.into();
        validate_package_name(&name)?;
        Ok(Self {
            name,
            version: "0.1.0".to_string(),
            required: vec![Role::PrimaryPlugin],
            pending: Vec::new(),
            copier,
        })
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Marks an additional role as required at build time.
    pub fn require(mut self, role: Role) -> Self {
        if !self.required.contains(&role) {
            self.required.push(role);
        }
        self
    }

    pub fn add_binary(&mut self, role: Role, source_path: impl AsRef<Path>) -> Result<(), Error> {
        let source = source_path.as_ref();
        let context = |err: Error| err.with_role(role.as_str()).with_path(source);
        if role == Role::TestModel {
            return Err(context(
                Error::new(ErrorKind::Usage)
                    .with_message("test models are generated; use with_test_model"),
            ));
        }
        let metadata = fs::metadata(source).map_err(|err| {
            context(
                Error::new(ErrorKind::MissingFile)
                    .with_message("source file does not exist")
                    .with_source(err),
            )
        })?;
        if !metadata.is_file() {
            return Err(context(
                Error::new(ErrorKind::MissingFile).with_message("source is not a regular file"),
            ));
        }
        let file_name = source.file_name().ok_or_else(|| {
            context(Error::new(ErrorKind::Usage).with_message("source path has no file name"))
        })?;
        let relative = Path::new(role.directory()).join(file_name);
        self.push(PendingEntry {
            role,
            source: Source::File(source.to_path_buf()),
            relative,
        })
    }

    pub fn add_resource(&mut self, source_path: impl AsRef<Path>) -> Result<(), Error> {
        self.add_binary(Role::Resource, source_path)
    }

    /// Includes the generated reference probe model as `testdata/mul.onnx`.
    pub fn with_test_model(&mut self) -> Result<(), Error> {
        self.push(PendingEntry {
            role: Role::TestModel,
            source: Source::ReferenceModel,
            relative: Path::new(Role::TestModel.directory()).join(REFERENCE_FILE_NAME),
        })
    }

    pub fn layout(&self) -> PackageLayout {
        PackageLayout {
            name: self.name.clone(),
            entries: self
                .pending
                .iter()
                .map(|entry| (entry.role.clone(), Path::new(&self.name).join(&entry.relative)))
                .collect(),
        }
    }

    fn push(&mut self, entry: PendingEntry) -> Result<(), Error> {
        if entry.role.is_singular() && self.pending.iter().any(|e| e.role == entry.role) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("role already registered")
                .with_role(entry.role.as_str()));
        }
        if let Some(existing) = self.pending.iter().find(|e| e.relative == entry.relative) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "destination {} is already used by role {}",
                    entry.relative.display(),
                    existing.role.as_str()
                ))
                .with_role(entry.role.as_str()));
        }
        tracing::debug!(role = entry.role.as_str(), destination = %entry.relative.display(), "registered package entry");
        self.pending.push(entry);
        Ok(())
    }

    /// Builds `<destination_root>/<name>`, replacing a previous build only on success.
    pub fn build(mut self, destination_root: impl AsRef<Path>) -> Result<BuiltPackage, Error> {
        let destination_root = destination_root.as_ref();
        for role in &self.required {
            if !self.pending.iter().any(|entry| &entry.role == role) {
                return Err(Error::new(ErrorKind::PackageIncomplete)
                    .with_message(format!("required role {} has no source", role.as_str()))
                    .with_role(role.as_str()));
            }
        }

        let created_top = first_missing_ancestor(destination_root);
        let result = fs::create_dir_all(destination_root)
            .map_err(|err| {
                io_error(err, destination_root)
                    .with_message("failed to create destination directory")
            })
            .and_then(|()| self.stage_and_install(destination_root));
        if result.is_err() {
            if let Some(top) = &created_top {
                // Staging is already gone (TempDir drop); only directories we created remain.
                remove_created_dirs(destination_root, top);
            }
        }
        result
    }

    fn stage_and_install(&mut self, destination_root: &Path) -> Result<BuiltPackage, Error> {
        let staging = tempfile::Builder::new()
            .prefix(".epkit-staging-")
            .tempdir_in(destination_root)
            .map_err(|err| {
                io_error(err, destination_root).with_message("failed to create staging directory")
            })?;
        let staged_package = staging.path().join(&self.name);
        tracing::debug!(staging = %staged_package.display(), "staging package");

        let mut entries = Vec::with_capacity(self.pending.len());
        for entry in &self.pending {
            let target = staged_package.join(&entry.relative);
            let context = |err: Error| err.with_role(entry.role.as_str());
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    context(io_error(err, parent).with_message("failed to create package directory"))
                })?;
            }
            match &entry.source {
                Source::File(source) => {
                    self.copier.copy(source, &target).map_err(|err| {
                        context(io_error(err, source).with_message(format!(
                            "failed to copy into package as {}",
                            entry.relative.display()
                        )))
                    })?;
                }
                Source::ReferenceModel => {
                    artifact::generate(&target).map_err(context)?;
                }
            }
            let bytes = fs::read(&target).map_err(|err| {
                context(io_error(err, &target).with_message("failed to read staged file"))
            })?;
            entries.push(ManifestEntry {
                role: entry.role.clone(),
                path: portable_path(&entry.relative),
                size: bytes.len() as u64,
                sha256: artifact::sha256_hex(&bytes),
            });
        }

        let manifest = PackageManifest {
            schema: MANIFEST_SCHEMA_VERSION,
            name: self.name.clone(),
            version: self.version.clone(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            entries,
        };
        let manifest_path = staged_package.join(MANIFEST_FILE_NAME);
        let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode package manifest")
                .with_source(err)
        })?;
        fs::write(&manifest_path, manifest_json).map_err(|err| {
            io_error(err, &manifest_path).with_message("failed to write package manifest")
        })?;

        let final_root = destination_root.join(&self.name);
        install(&staged_package, &final_root, staging.path())?;
        tracing::info!(package = %final_root.display(), entries = manifest.entries.len(), "package built");

        Ok(BuiltPackage {
            root: final_root,
            layout: self.layout(),
            manifest,
        })
    }
}

/// Renames `staged` to `target`, parking any previous build inside `scratch` until the swap succeeds.
fn install(staged: &Path, target: &Path, scratch: &Path) -> Result<(), Error> {
    let previous = scratch.join(".previous");
    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, &previous).map_err(|err| {
            io_error(err, target).with_message("failed to move previous package aside")
        })?;
    }
    if let Err(err) = fs::rename(staged, target) {
        if had_previous {
            if let Err(restore) = fs::rename(&previous, target) {
                tracing::error!(path = %target.display(), error = %restore, "failed to restore previous package");
            }
        }
        return Err(io_error(err, target).with_message("failed to move staged package into place"));
    }
    Ok(())
}

/// Outermost ancestor of `path` (inclusive) that does not exist yet.
fn first_missing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut missing = None;
    for ancestor in path.ancestors() {
        if ancestor.as_os_str().is_empty() || ancestor.exists() {
            break;
        }
        missing = Some(ancestor.to_path_buf());
    }
    missing
}

/// Removes empty directories from `leaf` up to and including `top`.
fn remove_created_dirs(leaf: &Path, top: &Path) {
    for dir in leaf.ancestors() {
        if let Err(err) = fs::remove_dir(dir) {
            tracing::debug!(path = %dir.display(), error = %err, "left directory in place");
            break;
        }
        if dir == top {
            break;
        }
    }
}

fn portable_path(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn validate_package_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid package name {name:?}"))
            .with_hint("Use ASCII letters, digits, '_', '-', or '.', not starting with '.'."))
    }
}

#[cfg(test)]
mod tests {
    use super::{FileCopier, FsCopier, MANIFEST_FILE_NAME, PackageBuilder, Role};
    use crate::core::artifact;
    use crate::core::error::ErrorKind;
    use crate::core::graph::ComputationGraph;
    use std::io;
    use std::path::{Path, PathBuf};

    struct FailAfter {
        remaining: usize,
    }

    impl FileCopier for FailAfter {
        fn copy(&mut self, source: &Path, destination: &Path) -> io::Result<u64> {
            if self.remaining == 0 {
                std::fs::write(destination, b"partial")?;
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
            self.remaining -= 1;
            FsCopier.copy(source, destination)
        }
    }

    struct Sources {
        temp: tempfile::TempDir,
        plugin: PathBuf,
        dependency: PathBuf,
        resource: PathBuf,
    }

    fn sources() -> Sources {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let plugin = src.join("libexample_ep.so");
        let dependency = src.join("libonnxruntime.so.1");
        let resource = src.join("LICENSE");
        std::fs::write(&plugin, b"plugin-bytes").unwrap();
        std::fs::write(&dependency, b"host-bytes").unwrap();
        std::fs::write(&resource, b"license").unwrap();
        Sources {
            temp,
            plugin,
            dependency,
            resource,
        }
    }

    fn populate<C: FileCopier>(builder: &mut PackageBuilder<C>, src: &Sources) {
        builder.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        builder.add_binary(Role::Dependency, &src.dependency).unwrap();
        builder.add_resource(&src.resource).unwrap();
    }

    #[test]
    fn build_lays_out_binaries_adjacent() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut builder = PackageBuilder::new("example_ep").unwrap();
        populate(&mut builder, &src);
        builder.with_test_model().unwrap();

        let built = builder.build(&dest).expect("build");

        let root = dest.join("example_ep");
        assert_eq!(built.root, root);
        assert_eq!(std::fs::read(root.join("libs/libexample_ep.so")).unwrap(), b"plugin-bytes");
        assert_eq!(std::fs::read(root.join("libs/libonnxruntime.so.1")).unwrap(), b"host-bytes");
        assert_eq!(std::fs::read(root.join("resources/LICENSE")).unwrap(), b"license");
        let model = artifact::read_graph(root.join("testdata/mul.onnx")).expect("model");
        assert_eq!(model, ComputationGraph::reference());

        assert_eq!(
            built.layout.path_for(&Role::Dependency),
            Some(Path::new("example_ep/libs/libonnxruntime.so.1"))
        );
        let by_role = built.manifest.paths_by_role();
        assert_eq!(by_role[&Role::PrimaryPlugin], ["libs/libexample_ep.so"]);
        assert_eq!(by_role[&Role::TestModel], ["testdata/mul.onnx"]);

        let entries: Vec<_> = std::fs::read_dir(&dest)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["example_ep"]);
    }

    #[test]
    fn manifest_file_matches_returned_manifest() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut builder = PackageBuilder::new("example_ep").unwrap().version("1.2.3");
        populate(&mut builder, &src);
        let built = builder.build(&dest).expect("build");

        let text = std::fs::read_to_string(built.root.join(MANIFEST_FILE_NAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["name"], "example_ep");
        assert_eq!(value["version"], "1.2.3");
        assert_eq!(value["entries"][0]["role"], "primary_plugin");
        assert_eq!(
            value["entries"][0]["sha256"],
            artifact::sha256_hex(b"plugin-bytes").as_str()
        );
        assert_eq!(built.manifest.entries.len(), 3);
    }

    #[test]
    fn missing_primary_plugin_is_incomplete() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut builder = PackageBuilder::new("example_ep").unwrap();
        builder.add_binary(Role::Dependency, &src.dependency).unwrap();
        builder.add_resource(&src.resource).unwrap();

        let err = builder.build(&dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PackageIncomplete);
        assert_eq!(err.role(), Some("primary_plugin"));
        assert!(!dest.exists());
    }

    #[test]
    fn required_dependency_role_is_enforced() {
        let src = sources();
        let mut builder = PackageBuilder::new("example_ep").unwrap().require(Role::Dependency);
        builder.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        let err = builder.build(src.temp.path().join("dist")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PackageIncomplete);
        assert_eq!(err.role(), Some("dependency"));
    }

    #[test]
    fn add_binary_rejects_missing_and_non_regular_sources() {
        let src = sources();
        let mut builder = PackageBuilder::new("example_ep").unwrap();

        let err = builder
            .add_binary(Role::PrimaryPlugin, src.temp.path().join("absent.so"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingFile);

        let err = builder
            .add_binary(Role::PrimaryPlugin, src.temp.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingFile);
    }

    #[test]
    fn duplicate_singular_role_is_rejected() {
        let src = sources();
        let mut builder = PackageBuilder::new("example_ep").unwrap();
        builder.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        let err = builder
            .add_binary(Role::PrimaryPlugin, &src.dependency)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn disk_full_mid_copy_leaves_no_new_files() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut builder =
            PackageBuilder::with_copier("example_ep", FailAfter { remaining: 1 }).unwrap();
        populate(&mut builder, &src);

        let err = builder.build(&dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.role(), Some("dependency"));
        assert!(!dest.exists(), "destination root created by the failed build must be removed");

        let mut retry = PackageBuilder::new("example_ep").unwrap();
        populate(&mut retry, &src);
        retry.build(&dest).expect("retry after fault cleared");
        assert!(dest.join("example_ep/libs/libonnxruntime.so.1").is_file());
    }

    #[test]
    fn failed_build_removes_every_directory_it_created() {
        let src = sources();
        let outer = src.temp.path().join("out");
        let dest = outer.join("nested").join("dist");
        let mut builder =
            PackageBuilder::with_copier("example_ep", FailAfter { remaining: 0 }).unwrap();
        populate(&mut builder, &src);

        assert!(builder.build(&dest).is_err());
        assert!(!outer.exists());
        assert!(src.temp.path().join("src").is_dir());
    }

    #[test]
    fn missing_ancestor_stops_at_first_existing_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dest = temp.path().join("a").join("b");
        assert_eq!(
            super::first_missing_ancestor(&dest),
            Some(temp.path().join("a"))
        );
        assert_eq!(super::first_missing_ancestor(temp.path()), None);
    }

    #[cfg(unix)]
    #[test]
    fn packaged_test_model_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let src = sources();
        let mut builder = PackageBuilder::new("example_ep").unwrap();
        builder.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        builder.with_test_model().unwrap();
        let built = builder.build(src.temp.path().join("dist")).expect("build");

        let model = std::fs::metadata(built.root.join("testdata/mul.onnx")).unwrap();
        assert_eq!(model.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn failed_rebuild_keeps_previous_package() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut first = PackageBuilder::new("example_ep").unwrap();
        populate(&mut first, &src);
        first.build(&dest).expect("first build");

        std::fs::write(&src.plugin, b"new-plugin-bytes").unwrap();
        let mut second =
            PackageBuilder::with_copier("example_ep", FailAfter { remaining: 2 }).unwrap();
        populate(&mut second, &src);
        assert!(second.build(&dest).is_err());

        assert_eq!(
            std::fs::read(dest.join("example_ep/libs/libexample_ep.so")).unwrap(),
            b"plugin-bytes"
        );
        let entries: Vec<_> = std::fs::read_dir(&dest)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["example_ep"]);
    }

    #[test]
    fn rebuild_replaces_previous_package() {
        let src = sources();
        let dest = src.temp.path().join("dist");
        let mut first = PackageBuilder::new("example_ep").unwrap();
        populate(&mut first, &src);
        first.with_test_model().unwrap();
        first.build(&dest).expect("first build");

        let mut second = PackageBuilder::new("example_ep").unwrap();
        second.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        second.build(&dest).expect("second build");

        assert!(!dest.join("example_ep/testdata").exists());
        assert!(dest.join("example_ep/libs/libexample_ep.so").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_permissions_and_mtime() {
        use std::os::unix::fs::PermissionsExt;

        let src = sources();
        std::fs::set_permissions(&src.plugin, std::fs::Permissions::from_mode(0o750)).unwrap();
        let past = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        std::fs::File::options()
            .write(true)
            .open(&src.plugin)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let dest = src.temp.path().join("dist");
        let mut builder = PackageBuilder::new("example_ep").unwrap();
        builder.add_binary(Role::PrimaryPlugin, &src.plugin).unwrap();
        let built = builder.build(&dest).expect("build");

        let copied = std::fs::metadata(built.root.join("libs/libexample_ep.so")).unwrap();
        assert_eq!(copied.permissions().mode() & 0o777, 0o750);
        assert_eq!(copied.modified().unwrap(), past);
    }

    #[test]
    fn invalid_package_names_are_usage_errors() {
        for name in ["", ".hidden", "a/b", "sp ace"] {
            let err = PackageBuilder::new(name).err().expect(name);
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }
}
