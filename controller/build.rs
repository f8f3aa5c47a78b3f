fn main() {
    // esp-idf-sys needs the ESP-IDF environment exported to the linker.
    if std::env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
