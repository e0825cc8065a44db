fn main() {
    // ── macOS: CoreBluetooth needs an embedded Info.plist ─────────────────────
    //
    // CBCentralManager stays "unauthorised" for a bare CLI binary unless the
    // Mach-O carries NSBluetoothAlwaysUsageDescription. The plist is linked
    // into the __TEXT,__info_plist section, which macOS reads like a bundle's
    // Info.plist. CARGO_CFG_TARGET_OS is the *target* OS, so cross builds work.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    let plist = format!("{dir}/Info.plist");

    for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
        println!("cargo:rustc-link-arg={arg}");
    }
    println!("cargo:rerun-if-changed=Info.plist");
}
