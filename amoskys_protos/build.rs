use std::io::Result;

/// Compiles the telemetry protocol definitions with tonic codegen.
fn main() -> Result<()> {
  let proto_files = ["amoskys/v1/telemetry.proto"];

  tonic_build::configure()
    .build_server(true)
    .build_client(true)
    .compile_protos(&proto_files, &["."])?;

  for proto in &proto_files {
    println!("cargo:rerun-if-changed={}", proto);
  }

  Ok(())
}
