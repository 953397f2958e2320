// Uses protox (pure Rust protobuf compiler) to avoid requiring an external
// protoc binary.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox does not emit rerun directives on its own.
    println!("cargo:rerun-if-changed=proto/plugin.proto");

    let file_descriptors = protox::compile(["proto/plugin.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(file_descriptors)?;
    Ok(())
}
