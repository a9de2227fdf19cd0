use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=FORMBD_LIB_DIR");

    // Only the `native` feature declares the extern block.
    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    let formbd_lib = env::var("FORMBD_LIB_DIR").unwrap_or_else(|_| "/usr/local/lib".to_string());

    println!("cargo:rustc-link-search=native={}", formbd_lib);
    println!("cargo:rustc-link-lib=formbd");
}
