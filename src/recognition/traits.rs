use async_trait::async_trait;

use crate::errors::TowerResult;
use crate::recognition::types::{AnalyzeArgs, AnalyzeResult, Frame, RecognitionDetail};

/// The host's recognition service, as seen from inside a handler.
#[async_trait]
pub trait RecognitionHost: Send + Sync {
    /// Run one recognition pass over `frame` using `pipeline_override` for `entry`.
    /// `Ok(None)` means the host produced no detail at all, which counts as a miss.
    async fn run_recognition(
        &self,
        entry: &str,
        frame: &Frame,
        pipeline_override: serde_json::Value,
    ) -> TowerResult<Option<RecognitionDetail>>;
}

/// A custom recognition the host can invoke by name.
#[async_trait]
pub trait CustomRecognition: Send + Sync {
    async fn analyze(
        &self,
        host: &dyn RecognitionHost,
        args: AnalyzeArgs<'_>,
    ) -> TowerResult<AnalyzeResult>;
}
