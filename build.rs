//! Compiles the per-architecture fiber context-switch stub.
//!
//! Mirrors `wasmtime-internal-fiber`'s approach: the switch primitive itself
//! is a few instructions of hand-written assembly (there is no portable way
//! to ask a C/Rust compiler to "save these registers and jump to a
//! different stack" without either `asm!` naked functions or a tiny
//! standalone `.s` file compiled via `cc`); everything around it — stack
//! allocation, the fiber bookkeeping, lifecycle — is ordinary Rust.

fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let file = match arch.as_str() {
        "x86_64" => "src/fiber/arch/x86_64.s",
        "aarch64" => "src/fiber/arch/aarch64.s",
        other => {
            // The fiber module's own `compile_error!` produces a much
            // friendlier message; this just keeps the build from failing
            // with a missing-file error first.
            println!("cargo:warning=unsupported architecture for fiber context switch: {other}");
            return;
        }
    };
    println!("cargo:rerun-if-changed={file}");
    cc::Build::new().file(file).compile("weave_fiber_switch");
}
