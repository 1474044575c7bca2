use anyhow::{Context, Result};
use ort::execution_providers;
use ort::session::builder::GraphOptimizationLevel;
pub use ort::session::Session;
use std::path::Path;
use std::sync::Once;
use tracing::{debug, warn};

static ORT_INIT: Once = Once::new();

fn init_runtime() {
    ORT_INIT.call_once(|| {
        let res = ort::init()
            .with_name("facemask")
            .with_execution_providers([
                execution_providers::XNNPACKExecutionProvider::default().build()
            ])
            .commit();
        if let Err(e) = res {
            warn!("Failed to configure onnx runtime, using defaults: {e:?}");
        }
    });
}

pub fn initialize_model(model_dir: &Path, filename: &str, threads: usize) -> Result<Session> {
    init_runtime();

    let path = model_dir.join(filename);
    debug!("Loading model {path:?} with {threads} threads");

    let model = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads.max(1))?
        .commit_from_file(&path)
        .with_context(|| format!("Failed to load model {path:?}"))?;

    Ok(model)
}
