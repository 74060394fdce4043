use std::env;
use std::path::Path;

// pnet's datalink backend on Windows links against the Npcap SDK's Packet.lib.
fn main() {
    println!("cargo:rerun-if-env-changed=NPCAP_SDK_PATH");

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }

    let sdk_path = env::var("NPCAP_SDK_PATH").ok().or_else(|| {
        let default_path = "C:\\Program Files\\Npcap";
        Path::new(default_path)
            .exists()
            .then(|| default_path.to_string())
    });

    match sdk_path {
        Some(path) => {
            println!("cargo:rustc-link-search=native={}\\Lib\\x64", path);
            println!("cargo:rustc-link-lib=static=Packet");
        }
        None => {
            println!("cargo:warning=Npcap SDK not found in the default location.");
            println!("cargo:warning=Set NPCAP_SDK_PATH to the Npcap SDK directory, e.g. C:\\npcap-sdk");
        }
    }
}
