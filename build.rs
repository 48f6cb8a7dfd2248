// build.rs
//
// The host engine needs no build-time work. When the `cuda` feature is
// enabled, compile the swath kernel to PTX so the wrapper can embed it via
// include_str!(concat!(env!("OUT_DIR"), "/dtw_swath.ptx")).
use std::{env, path::PathBuf, process::Command};

fn main() {
    println!("cargo:rerun-if-changed=kernels/dtw_swath.cu");

    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set by cargo"));
    let ptx_path = out_dir.join("dtw_swath.ptx");

    let status = Command::new("nvcc")
        .args(["-ptx", "-O3", "--restrict", "-o"])
        .arg(&ptx_path)
        .arg("kernels/dtw_swath.cu")
        .status()
        .expect("`cuda` feature enabled but nvcc was not found on PATH");

    if !status.success() {
        panic!("nvcc failed to compile kernels/dtw_swath.cu (exit: {status})");
    }
}
