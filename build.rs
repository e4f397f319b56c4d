//! Build script for pagedkv-engine.
//!
//! In a production build targeting Apple Silicon, this would:
//! 1. Locate the Metal shader sources for the fused prefill/decode
//!    attention kernels (`.metal` files, not part of this crate's
//!    safe-Rust reference implementation).
//! 2. Compile them to a `.metallib` via `xcrun metal` / `xcrun metallib`.
//! 3. Emit the library path for `metal::Device::new_library_with_file`
//!    to pick up at runtime.
//!
//! For now it's a placeholder that documents the intended build
//! process; the `metal-accel` feature without a compiled `.metallib`
//! falls back to the CPU reference kernels at runtime (see
//! `accelerator::AcceleratorContext`).

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Future: compile the fused attention kernels to a Metal shader library.
    //
    // Steps:
    // 1. Locate `xcrun` (fails the build on non-Apple hosts; gate behind
    //    the `metal-accel` feature so CPU-only builds are unaffected).
    // 2. Compile each `.metal` source to AIR: `xcrun -sdk macosx metal -c
    //    src/kernels/metal/*.metal -o $OUT_DIR/*.air`.
    // 3. Link AIR objects into one library: `xcrun -sdk macosx metallib
    //    $OUT_DIR/*.air -o $OUT_DIR/kernels.metallib`.
    // 4. Emit `cargo:rustc-env=PAGEDKV_METALLIB_PATH=$OUT_DIR/kernels.metallib`
    //    so `AcceleratorContext::new` can load it at runtime instead of
    //    relying on an ad-hoc env-var search path.
    //
    // Example (when implemented):
    //
    // ```
    // let out_dir = std::env::var("OUT_DIR").unwrap();
    // let status = std::process::Command::new("xcrun")
    //     .args(["-sdk", "macosx", "metal", "-c"])
    //     .arg("src/kernels/metal/attention.metal")
    //     .args(["-o", &format!("{out_dir}/attention.air")])
    //     .status()
    //     .expect("xcrun metal failed to run");
    // assert!(status.success());
    // ```

    #[cfg(feature = "metal-accel")]
    {
        println!("cargo:warning=metal-accel enabled — no .metallib compile step wired up yet, falling back to CPU reference kernels at runtime");
    }
}
