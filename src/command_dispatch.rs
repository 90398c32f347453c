//! Purpose: Hold top-level CLI command dispatch for `epkit`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Library commands emit exactly one JSON document on stdout on success.
//! Invariants: Residency notices go to stderr and never change the exit code.

use super::*;

use epkit::core::artifact;
use epkit::core::graph::{ComputationGraph, ElementType};
use epkit::core::loader::LoaderBackend;
use epkit::core::package::{PackageBuilder, Role};
use epkit::core::resolver::{ConflictPolicy, HOST_PLUGIN_ENTRY_POINTS, LibraryResolver};
use epkit::notice::residency_notice;

pub(super) fn dispatch_command(
    command: Command,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "epkit", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::GenModel { output, op, shape } => {
            let shape = parse_shape(&shape)?;
            let op: BinaryOp = op.into();
            // Mul over [2,3] yields exactly the reference graph.
            let graph = ComputationGraph::binary(
                op.op_type().to_ascii_lowercase(),
                op,
                &shape,
                ElementType::Float,
            )?;
            let path = model_output_path(&output);
            let generated = artifact::generate_graph(&graph, &path)?;
            emit_json(json!({
                "artifact": {
                    "path": generated.path.display().to_string(),
                    "size": generated.size,
                    "sha256": generated.sha256,
                    "op": graph.op().op_type(),
                    "shape": shape,
                }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Load {
            plugin,
            dependency,
            require_symbol,
            check_entry_points,
            allow_shadowing,
        } => {
            let policy = if allow_shadowing {
                ConflictPolicy::Allow
            } else {
                ConflictPolicy::Fail
            };
            let mut resolver = LibraryResolver::native().with_conflict_policy(policy);
            if check_entry_points {
                for symbol in HOST_PLUGIN_ENTRY_POINTS {
                    resolver = resolver.require_plugin_symbol(symbol);
                }
            }
            for symbol in require_symbol {
                resolver = resolver.require_plugin_symbol(symbol);
            }

            let report = resolver.resolve_and_load_plugin(&plugin, dependency.as_deref())?;
            for loaded in report.dependency.iter().chain(std::iter::once(&report.plugin)) {
                if let Some(notice) = residency_notice(loaded, "load", notice_time_now()) {
                    emit_notice(&notice, color_mode);
                }
            }
            emit_json(json!({
                "load": {
                    "platform": report.platform,
                    "dependency": report.dependency.as_ref().map(library_json),
                    "plugin": library_json(&report.plugin),
                }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Probe { name } => {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("probe takes a library file name, not a path")
                    .with_hint("Use the file name only, e.g. `epkit probe libonnxruntime.so.1`."));
            }
            let resolver = LibraryResolver::native();
            let residency = resolver.probe(&name);
            emit_json(json!({
                "probe": {
                    "platform": resolver.backend().platform(),
                    "library": name,
                    "resident": residency.is_some(),
                    "path": residency
                        .and_then(|residency| residency.path)
                        .map(|path| path.display().to_string()),
                }
            }));
            Ok(RunOutcome::ok())
        }
        Command::Package {
            name,
            plugin,
            dependency,
            resource,
            with_test_model,
            require_dependency,
            package_version,
            out,
        } => {
            let mut builder = PackageBuilder::new(name)?.version(package_version);
            if require_dependency {
                builder = builder.require(Role::Dependency);
            }
            if let Some(plugin) = plugin {
                builder.add_binary(Role::PrimaryPlugin, plugin)?;
            }
            if let Some(dependency) = dependency {
                builder.add_binary(Role::Dependency, dependency)?;
            }
            for resource in resource {
                builder.add_resource(resource)?;
            }
            if with_test_model {
                builder.with_test_model()?;
            }

            let built = builder.build(&out)?;
            let manifest = serde_json::to_value(&built.manifest).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode manifest")
                    .with_source(err)
            })?;
            emit_json(json!({
                "package": {
                    "root": built.root.display().to_string(),
                    "manifest": manifest,
                }
            }));
            Ok(RunOutcome::ok())
        }
    }
}
