//! Compile time configurations for the util crate
fn main() {
    // the HUBSIM_PKG_NAME variable is used to create the config folder under
    // `~/.config`. Do not change the name unless you know what you are doing
    // as the tools will no longer find previously stored device identities.
    println!("cargo::rustc-env=HUBSIM_PKG_NAME=hubsim");
}
