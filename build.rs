fn main() {
    set_version();
}

/// Make the package version, suffixed with the current git hash when one
/// is available, visible to the build as `NETPULSE_VERSION`.
fn set_version() {
    let version = env!("CARGO_PKG_VERSION");

    match git_revision_hash() {
        Some(rev) => println!("cargo:rustc-env=NETPULSE_VERSION={} ({})", version, rev),
        None => println!("cargo:rustc-env=NETPULSE_VERSION={}", version),
    }
}

fn git_revision_hash() -> Option<String> {
    use std::process::Command;

    let args = &["rev-parse", "--short=10", "HEAD"];
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!rev.is_empty()).then_some(rev)
}
