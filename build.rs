use std::env;

fn main() {
    // Expose the package version to the CLI under a stable name
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=SLIDESTITCH_VERSION={}", version);

    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=Cargo.toml");
}
