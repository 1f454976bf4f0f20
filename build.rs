fn main() {
    // Stamped by the release pipeline; local builds report 0.
    let build_number = std::fs::read_to_string("BUILD_NUMBER")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "0".to_string());

    println!("cargo:rustc-env=BUILD_NUMBER={build_number}");
    println!("cargo:rerun-if-changed=BUILD_NUMBER");
}
