fn main() {
    // ESP-IDF sysenv is only meaningful when cross-compiling the display
    // MCU image; host builds (simulation + tests) skip it.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
