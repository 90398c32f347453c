//! Purpose: `epkit` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit compact JSON on stdout when piped and pretty JSON on a TTY.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
//! Invariants: Logs go to stderr and are filtered by `RUST_LOG` (default `warn`).
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use epkit::core::error::{Error, ErrorKind, to_exit_code};
use epkit::core::graph::BinaryOp;
use epkit::core::resolver::LoadedLibrary;
use epkit::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(clap_error_hint(&err)),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, color_mode)
        .map_err(add_load_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "epkit",
    version,
    about = "Load and package native execution-provider plugins by explicit path",
    long_about = None,
    before_help = r#"A plugin library usually depends on a specific host runtime library. epkit loads
that dependency by its full path before the plugin, so the OS loader cannot bind the
plugin to some other installed copy."#,
    after_help = r#"EXAMPLES
  $ epkit gen-model ./testdata                        # writes ./testdata/mul.onnx
  $ epkit load --plugin ./libexample_ep.so --dependency /opt/ort/lib/libonnxruntime.so.1
  $ epkit package --name example_ep --plugin ./libexample_ep.so --with-test-model --out dist

ENVIRONMENT
  EPKIT_PLUGIN_PATH, EPKIT_DEPENDENCY_PATH, EPKIT_PACKAGE_DIR fill in the matching flags.
  RUST_LOG controls log output on stderr (default: warn)."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OpCli {
    Mul,
    Add,
    Sub,
    Div,
}

impl From<OpCli> for BinaryOp {
    fn from(op: OpCli) -> Self {
        match op {
            OpCli::Mul => BinaryOp::Mul,
            OpCli::Add => BinaryOp::Add,
            OpCli::Sub => BinaryOp::Sub,
            OpCli::Div => BinaryOp::Div,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        name = "gen-model",
        arg_required_else_help = true,
        about = "Write the single-operator probe model (ONNX)",
        after_help = r#"EXAMPLES
  $ epkit gen-model mul.onnx
  $ epkit gen-model ./testdata                 # directory: writes ./testdata/mul.onnx
  $ epkit gen-model add.onnx --op add --shape 1,3,2

NOTES
  - The parent directory must exist.
  - Output is byte-identical for identical options."#
    )]
    GenModel {
        #[arg(help = "Output file, or an existing directory", value_hint = ValueHint::AnyPath)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "mul", help = "Element-wise operator")]
        op: OpCli,
        #[arg(long, default_value = "2,3", help = "Static shape shared by inputs and output")]
        shape: String,
    },
    #[command(
        about = "Load a plugin library after its dependency, by explicit path",
        after_help = r#"EXAMPLES
  $ epkit load --plugin ./libexample_ep.so
  $ epkit load --plugin ./libexample_ep.so --dependency /opt/ort/lib/libonnxruntime.so.1 --check-entry-points

NOTES
  - A dependency already loaded from a different path is an error unless --allow-shadowing.
  - Failed loads are never retried with another path."#
    )]
    Load {
        #[arg(long, env = "EPKIT_PLUGIN_PATH", value_hint = ValueHint::FilePath)]
        plugin: PathBuf,
        #[arg(long, env = "EPKIT_DEPENDENCY_PATH", value_hint = ValueHint::FilePath)]
        dependency: Option<PathBuf>,
        #[arg(long = "require-symbol", value_name = "SYMBOL", help = "Symbol the plugin must export (repeatable)")]
        require_symbol: Vec<String>,
        #[arg(long, help = "Require the host plugin entry points (CreateEpFactories, ReleaseEpFactory)")]
        check_entry_points: bool,
        #[arg(long, help = "Load even if a same-named library is resident from another path")]
        allow_shadowing: bool,
    },
    #[command(
        arg_required_else_help = true,
        about = "Report whether a library is resident in this process",
        after_help = r#"EXAMPLES
  $ epkit probe libc.so.6

NOTES
  - The resident path is reported on Linux; other platforms report presence only."#
    )]
    Probe {
        #[arg(help = "Logical library name (file name, e.g. libonnxruntime.so.1)")]
        name: String,
    },
    #[command(
        about = "Assemble a plugin package directory",
        after_help = r#"EXAMPLES
  $ epkit package --name example_ep --plugin ./libexample_ep.so --out dist
  $ epkit package --name trt_ep --plugin TensorRTEp.dll --dependency onnxruntime.dll \
      --resource LICENSE --with-test-model --out dist

NOTES
  - Layout: <out>/<name>/{libs,resources,testdata}/ plus manifest.json.
  - A failed build leaves <out> absent or unchanged."#
    )]
    Package {
        #[arg(long, help = "Package directory name")]
        name: String,
        #[arg(long, env = "EPKIT_PLUGIN_PATH", value_hint = ValueHint::FilePath)]
        plugin: Option<PathBuf>,
        #[arg(long, env = "EPKIT_DEPENDENCY_PATH", value_hint = ValueHint::FilePath)]
        dependency: Option<PathBuf>,
        #[arg(long, value_hint = ValueHint::FilePath, help = "Resource file (repeatable)")]
        resource: Vec<PathBuf>,
        #[arg(long, help = "Include the generated probe model as testdata/mul.onnx")]
        with_test_model: bool,
        #[arg(long, help = "Fail unless --dependency is given")]
        require_dependency: bool,
        #[arg(long = "version", default_value = "0.1.0", help = "Version recorded in manifest.json")]
        package_version: String,
        #[arg(long, env = "EPKIT_PACKAGE_DIR", value_hint = ValueHint::DirPath)]
        out: PathBuf,
    },
    #[command(about = "Print version info")]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ epkit completion bash > ~/.local/share/bash-completion/completions/epkit"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn parse_shape(input: &str) -> Result<Vec<usize>, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid shape {input:?}"))
            .with_hint("Use comma-separated positive integers, e.g. 2,3.")
    };
    let dims = input
        .split(',')
        .map(|part| part.trim().parse::<usize>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if dims.is_empty() || dims.contains(&0) {
        return Err(invalid());
    }
    Ok(dims)
}

fn add_load_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::MissingFile => err.with_hint("Check the path; it must point to an existing regular file."),
        ErrorKind::LibraryLoad => err.with_hint(
            "The library could not be loaded as-is. Check architecture, permissions, and its own dependencies.",
        ),
        _ => err,
    }
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Check directory permissions or choose a writable location.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn library_json(loaded: &LoadedLibrary) -> Value {
    json!({
        "library": loaded.logical_name,
        "path": loaded.path.display().to_string(),
        "outcome": loaded.outcome.label(),
    })
}

fn emit_json(value: Value) {
    let pretty = io::stdout().is_terminal();
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("epkit {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "epkit",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> String {
    use time::format_description::well_known::Rfc3339;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| {
            time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()
        })
        .and_then(|ts| ts.format(&Rfc3339).ok())
        .unwrap_or_default()
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("{label} {}", notice.message);
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::MissingFile => "missing file".to_string(),
        ErrorKind::LibraryLoad => "library failed to load".to_string(),
        ErrorKind::DependencyOrder => "dependency not satisfied".to_string(),
        ErrorKind::PackageIncomplete => "package incomplete".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(role) = err.role() {
        inner.insert("role".to_string(), json!(role));
    }
    if let Some(library) = err.library() {
        inner.insert("library".to_string(), json!(library));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(library) = err.library() {
        lines.push(format!(
            "{} {library}",
            colorize_label("library:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(role) = err.role() {
        lines.push(format!(
            "{} {role}",
            colorize_label("role:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `epkit --help`.".to_string();
    };
    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "epkit") else {
        return "Try `epkit --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `epkit --help`.".to_string();
    }
    format!("Try `epkit {} --help`.", parts.join(" "))
}

/// Resolves the `gen-model` target: an existing directory gets the reference file name.
fn model_output_path(output: &Path) -> PathBuf {
    if output.is_dir() {
        output.join(epkit::core::artifact::REFERENCE_FILE_NAME)
    } else {
        output.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Error, ErrorKind, error_json, error_text, model_output_path, parse_shape};
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_shape_accepts_positive_dims() {
        assert_eq!(parse_shape("2,3").unwrap(), [2, 3]);
        assert_eq!(parse_shape(" 1, 3 ,2").unwrap(), [1, 3, 2]);
    }

    #[test]
    fn parse_shape_rejects_bad_input() {
        for input in ["", "2,,3", "2,0", "a,b", "-1"] {
            let err = parse_shape(input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage, "{input}");
        }
    }

    #[test]
    fn error_json_carries_role_library_and_path() {
        let err = Error::new(ErrorKind::DependencyOrder)
            .with_message("failed to load plugin")
            .with_role("plugin")
            .with_library("libexample_ep.so")
            .with_path("/opt/ep/libexample_ep.so");
        let value = error_json(&err);
        let inner = &value["error"];
        assert_eq!(inner["kind"], "DependencyOrder");
        assert_eq!(inner["role"], "plugin");
        assert_eq!(inner["library"], "libexample_ep.so");
        assert_eq!(inner["path"], "/opt/ep/libexample_ep.so");
        assert!(inner.get("hint").is_none());
    }

    #[test]
    fn error_text_without_color_has_plain_labels() {
        let err = Error::new(ErrorKind::MissingFile)
            .with_message("library file does not exist")
            .with_hint("Check the path.");
        let text = error_text(&err, false);
        assert!(text.starts_with("error: library file does not exist"));
        assert!(text.contains("hint: Check the path."));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn model_output_path_appends_reference_name_for_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(model_output_path(temp.path()), temp.path().join("mul.onnx"));
        let file = temp.path().join("probe.onnx");
        assert_eq!(model_output_path(&file), file);
    }
}
