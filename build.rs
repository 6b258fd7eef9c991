fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");

    // git info is optional: built leaves GIT_COMMIT_HASH as None outside a repository
    if let Err(err) = built::write_built_file() {
        println!("cargo:warning=failed to acquire build-time information: {err}");
    }
}
