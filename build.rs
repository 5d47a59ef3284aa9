use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/gtfs-realtime.proto");

    let protoc_path = protoc_bin_vendored::protoc_bin_path()?;

    unsafe {
        std::env::set_var("PROTOC", protoc_path);
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    prost_build::Config::new()
        .file_descriptor_set_path(out_dir.join("gtfs_realtime_descriptor.bin"))
        .compile_protos(&["proto/gtfs-realtime.proto"], &["proto/"])?;

    Ok(())
}
