fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/raft.proto");
    // protoc is only required by the gRPC transport.
    if std::env::var_os("CARGO_FEATURE_GRPC").is_some() {
        tonic_build::compile_protos("proto/raft.proto")?;
    }
    Ok(())
}
