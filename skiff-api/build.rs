// Code generation for gRPC protobuf definitions

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/skiff.proto"], &["proto"])?;
    Ok(())
}
