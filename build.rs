//! Purpose: Compile the native shared-object fixtures used by loader integration tests.
//! Role: Cargo build-script; drives the `cc`-selected C compiler to link `-shared` images.
//! Invariants: Runs only for Linux targets; elsewhere it does nothing.
//! Invariants: All fixture hosts share the soname `libhost.so.1`; they differ in version and path.
//! Invariants: A missing C toolchain yields a warning and no `EPKIT_NATIVE_FIXTURES`, never a build failure.
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const HOST_SONAME: &str = "libhost.so.1";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=tests/fixtures/native");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let source_dir = manifest_dir.join("tests").join("fixtures").join("native");
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR"));
    let fixture_dir = out_dir.join("native-fixtures");

    match build_fixtures(&source_dir, &fixture_dir) {
        Ok(()) => println!(
            "cargo:rustc-env=EPKIT_NATIVE_FIXTURES={}",
            fixture_dir.display()
        ),
        Err(err) => println!("cargo:warning=native loader fixtures not built: {err}"),
    }
}

/// Layout under `fixture_dir`:
/// `system/libhost.so.1.16.0`, `good/libhost.so.1.22.0` (+ `good/libhost.so.1` symlink),
/// `newer/libhost.so.1.30.0` (adds `HOST_2`), `libexample_ep.so`, `libnewer_ep.so`.
fn build_fixtures(source_dir: &Path, fixture_dir: &Path) -> Result<(), String> {
    let _ = fs::remove_dir_all(fixture_dir);
    for sub in ["system", "good", "newer"] {
        fs::create_dir_all(fixture_dir.join(sub)).map_err(|err| err.to_string())?;
    }

    let host_c = source_dir.join("host.c");
    let host_1_map = source_dir.join("host_1.map");
    let host_2_map = source_dir.join("host_2.map");

    let system_host = fixture_dir.join("system").join("libhost.so.1.16.0");
    let good_host = fixture_dir.join("good").join("libhost.so.1.22.0");
    let newer_host = fixture_dir.join("newer").join("libhost.so.1.30.0");
    link_host(&system_host, &host_c, &host_1_map, 16, false)?;
    link_host(&good_host, &host_c, &host_1_map, 22, false)?;
    link_host(&newer_host, &host_c, &host_2_map, 30, true)?;
    std::os::unix::fs::symlink("libhost.so.1.22.0", fixture_dir.join("good").join(HOST_SONAME))
        .map_err(|err| err.to_string())?;

    link_shared(
        &fixture_dir.join("libexample_ep.so"),
        &[source_dir.join("example_ep.c"), good_host],
        &[],
    )?;
    link_shared(
        &fixture_dir.join("libnewer_ep.so"),
        &[source_dir.join("newer_ep.c"), newer_host],
        &[],
    )
}

fn link_host(output: &Path, source: &Path, version_script: &Path, version: u32, feature: bool) -> Result<(), String> {
    let mut flags = vec![
        format!("-DHOST_VERSION={version}"),
        format!("-Wl,-soname,{HOST_SONAME}"),
        format!("-Wl,--version-script={}", version_script.display()),
    ];
    if feature {
        flags.push("-DHOST_FEATURE".to_string());
    }
    link_shared(output, &[source.to_path_buf()], &flags)
}

fn link_shared(output: &Path, inputs: &[PathBuf], flags: &[String]) -> Result<(), String> {
    let compiler = cc::Build::new()
        .pic(true)
        .warnings(false)
        .try_get_compiler()
        .map_err(|err| err.to_string())?;
    let mut cmd = compiler.to_command();
    cmd.arg("-shared").args(flags).arg("-o").arg(output).args(inputs);
    let result = cmd
        .output()
        .map_err(|err| format!("failed to run {:?}: {err}", compiler.path()))?;
    if !result.status.success() {
        return Err(format!(
            "linking {} failed: {}",
            output.display(),
            String::from_utf8_lossy(&result.stderr).trim()
        ));
    }
    Ok(())
}
