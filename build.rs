fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // NOTE: type_attribute adds #[allow(missing_docs)] to all generated types
    // since protobuf-generated code cannot have doc comments at source
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .build_transport(false)
        .type_attribute(".", "#[allow(missing_docs)]")
        .compile_protos(&["proto/tekhsi.proto"], &["proto"])?;

    Ok(())
}
