fn main() {
	let rustc = rustc_version::version().expect("could not determine rustc version");
	println!("cargo:rustc-env=SYRAH_BUILD_RUSTC_VERSION={rustc}");
	println!("cargo:rerun-if-changed=build.rs");
}
