use std::process::Command;

// Capture the rustc version at build time; bundle metadata reports it as the
// runtime_version field.
fn main() {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    println!("cargo:rustc-env=AUTOBUNDLE_RUSTC_VERSION={version}");
    println!("cargo:rerun-if-changed=build.rs");
}
