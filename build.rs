use std::fs;
use std::path::Path;

/// `#define` names read from wifi_config.h and exported as compile-time env.
const DEFINES: [&str; 4] = ["WIFI_SSID", "WIFI_PASSWORD", "GITHUB_REPO", "GITHUB_TOKEN"];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    // Add crash log helper for better panic diagnostics
    println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    println!("cargo:rerun-if-changed=wifi_config.h");

    let config_path = "wifi_config.h";
    let contents = if Path::new(config_path).exists() {
        fs::read_to_string(config_path)?
    } else {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
        String::new()
    };

    for name in DEFINES {
        let value = define_value(&contents, name).unwrap_or_default();
        println!("cargo:rustc-env={}={}", name, value);
    }

    Ok(())
}

fn define_value<'a>(contents: &'a str, name: &str) -> Option<&'a str> {
    let directive = format!("#define {} ", name);
    contents
        .lines()
        .find(|l| l.trim_start().starts_with(&directive))
        .and_then(|l| l.split('"').nth(1))
}
