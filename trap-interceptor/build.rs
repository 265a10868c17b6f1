fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").expect("target_os not specified");

    if target_os != "linux" && target_os != "android" && target_os != "macos" {
        return;
    }

    println!("cargo:rerun-if-changed=src/jump.c");

    cc::Build::new().file("src/jump.c").compile("trapjump");
}
