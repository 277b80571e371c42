use crate::{
    config::{ExecutionProvider, RuntimeConfig},
    model_service::ModelError,
};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use std::path::Path;

fn execution_providers(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
    match provider {
        ExecutionProvider::Cpu => vec![CPUExecutionProvider::default().build()],
        ExecutionProvider::Cuda => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        ExecutionProvider::TensorRt => vec![
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build(),
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
    }
}

pub fn load_session(model_path: &Path, runtime: &RuntimeConfig) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_execution_providers(execution_providers(runtime.execution_provider))?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(runtime.intra_threads)?
        .commit_from_file(model_path)?;

    tracing::debug!(
        "Loaded {:?} with inputs {:?}",
        model_path,
        session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>()
    );

    Ok(session)
}

/// Turns a by-name output lookup into an error when the graph has no such output.
pub fn require_output<T>(output: Option<T>, name: &str) -> Result<T, ModelError> {
    output.ok_or_else(|| ModelError::Output(format!("model has no output named `{}`", name)))
}
