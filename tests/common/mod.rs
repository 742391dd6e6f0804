use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use downcall::{
    CallingConvention, ClassifyMode, FunctionDescriptor, Invoker, Linker, NativeSymbol, Target,
};

// Only the native-library tests build C code; other integration crates leave this unused.
#[allow(dead_code)]
pub fn clang_available() -> bool {
    Command::new("clang").arg("--version").output().is_ok()
}

/// Whether the host has a supported convention and a call trampoline.
#[allow(dead_code)]
pub fn host_supported() -> bool {
    (cfg!(target_arch = "x86_64") || cfg!(target_arch = "aarch64"))
        && CallingConvention::for_target(&Target::host()).is_ok()
}

#[allow(dead_code)]
pub fn write_source(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap_or_else(|err| panic!("write source: {err}"));
}

#[allow(dead_code)]
pub fn dynamic_library_filename(base: &str) -> String {
    if cfg!(target_os = "macos") {
        format!("lib{base}.dylib")
    } else {
        format!("lib{base}.so")
    }
}

/// Compile `source` into a shared library inside `dir` with clang.
#[allow(dead_code)]
pub fn compile_shared_library(dir: &Path, stem: &str, source: &str) -> PathBuf {
    let source_path = dir.join(format!("{stem}.c"));
    write_source(&source_path, source);
    let lib_path = dir.join(dynamic_library_filename(stem));

    let mut cmd = Command::new("clang");
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.args(["-shared", "-fPIC"]);
    }
    cmd.args(["-O1", "-o"]).arg(&lib_path).arg(&source_path);
    let output = cmd.output().expect("run clang");
    assert!(
        output.status.success(),
        "clang failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    lib_path
}

/// C declaration of the standard forced-stack prefix: eight `int64_t` then
/// eight `double`, placed ahead of a fixture's own parameters.
#[allow(dead_code)]
pub const C_STACK_PREFIX: &str = "int64_t i0, int64_t i1, int64_t i2, int64_t i3, \
int64_t i4, int64_t i5, int64_t i6, int64_t i7, \
double f0, double f1, double f2, double f3, double f4, double f5, double f6, double f7";

/// Define `$stacked` taking the standard forced-stack prefix (eight `i64`,
/// eight `f64`) ahead of `$plain`'s parameters and forwarding to it.
#[allow(unused_macros)]
macro_rules! stacked {
    ($(fn $stacked:ident => $plain:ident($($arg:ident: $ty:ty),*) $(-> $ret:ty)?;)*) => {
        $(
            #[allow(clippy::too_many_arguments)]
            extern "C" fn $stacked(
                _: i64, _: i64, _: i64, _: i64, _: i64, _: i64, _: i64, _: i64,
                _: f64, _: f64, _: f64, _: f64, _: f64, _: f64, _: f64, _: f64,
                $($arg: $ty),*
            ) $(-> $ret)? {
                $plain($($arg),*)
            }
        )*
    };
}

/// Link `plain` in register mode and `stacked`, which declares the standard
/// prefix, in forced-stack mode.
#[allow(dead_code)]
pub fn link_both(
    linker: &Linker,
    plain: &NativeSymbol,
    stacked: &NativeSymbol,
    descriptor: &FunctionDescriptor,
) -> Vec<(ClassifyMode, std::sync::Arc<Invoker>)> {
    [
        (ClassifyMode::Registers, plain),
        (ClassifyMode::forced_stack(), stacked),
    ]
    .into_iter()
    .map(|(mode, symbol)| {
        let plan = linker.plan(descriptor, &mode).expect("plan");
        let invoker = linker.link(symbol, descriptor, &plan).expect("link");
        (mode, invoker)
    })
    .collect()
}
