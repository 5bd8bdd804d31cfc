use protobuf_codegen::Codegen;

fn main() {
    Codegen::new()
        .protoc_path(&protoc_bin_vendored::protoc_bin_path().unwrap())
        .cargo_out_dir("generated")
        .input("src/protos/fabd.proto")
        .include("src/protos")
        .run_from_script();
}
