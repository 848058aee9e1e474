//! Build script for ProxyTray
//! Embeds Windows resource metadata

fn main() {
    #[cfg(windows)]
    {
        let mut res = winresource::WindowsResource::new();
        res.set("FileDescription", "ProxyTray");
        res.set("ProductName", "ProxyTray");
        res.set("InternalName", "ProxyTray");
        res.set("OriginalFilename", "ProxyTray.exe");
        res.set("CompanyName", "ProxyTray");
        res.set("LegalCopyright", "Copyright © 2026");
        res.set("ProductVersion", env!("CARGO_PKG_VERSION"));
        res.set("FileVersion", env!("CARGO_PKG_VERSION"));

        if let Err(e) = res.compile() {
            println!("cargo:warning=Failed to compile Windows resources: {}", e);
        }
    }
}
