use std::env;

fn main() {
    // Models are loaded at runtime; warn early when the default locations are empty
    let models = [
        ("detector", "ml_models/detector.onnx"),
        ("freshness classifier", "ml_models/freshness.onnx"),
    ];

    for (name, path) in models {
        println!("cargo:rerun-if-changed={}", path);
        match std::fs::metadata(path) {
            Ok(meta) => println!(
                "cargo:warning=Found {} model at {} ({:.1} MB)",
                name,
                path,
                meta.len() as f64 / 1_048_576.0
            ),
            Err(_) => println!(
                "cargo:warning={} model not found at {}; set the model path variables before starting the server",
                name, path
            ),
        }
    }

    // Acceleration features compiled into the inference sessions
    let enabled_features: Vec<&str> = [
        ("TENSORRT", "TensorRT"),
        ("CUDA", "CUDA"),
        ("COREML", "CoreML"),
        ("DIRECTML", "DirectML"),
        ("OPENVINO", "OpenVINO"),
    ]
    .iter()
    .filter(|(feature, _)| env::var(format!("CARGO_FEATURE_{}", feature)).is_ok())
    .map(|(_, name)| *name)
    .collect();

    if enabled_features.is_empty() {
        println!("cargo:warning=Building with CPU-only inference (no GPU acceleration)");
    } else {
        println!("cargo:warning=GPU acceleration enabled: {}", enabled_features.join(", "));
    }
}
