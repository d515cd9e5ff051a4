fn main() {
    for (k, v) in std::env::vars() {
        if k.starts_with("CARGO") || k.starts_with("PROFILE") || k.starts_with("OUT") {
            println!("cargo:warning={}={}", k, v);
        }
    }
}
