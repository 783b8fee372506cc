fn main() {
    // CoreBluetooth refuses to scan from a binary without an embedded
    // Info.plist carrying NSBluetoothAlwaysUsageDescription. A CLI tool has
    // no bundle, so the plist goes into the `__TEXT,__info_plist` section
    // through the linker's `-sectcreate`.
    //
    // CARGO_CFG_TARGET_OS is the target, so cross builds to macOS work too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };

    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rustc-link-arg-bins={dir}/Info.plist");
    println!("cargo:rerun-if-changed=Info.plist");
}
