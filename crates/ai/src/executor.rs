use taskforge_core::{CapabilityType, DomainType};
use tokio_util::sync::CancellationToken;

use crate::result::{ExecutionError, ExecutionOutput};

/// Runs tasks of one business domain.
///
/// Executors are stateless with respect to tasks: everything they need comes
/// in through `execute`, and they never touch the task store. The engine
/// records their output (or error) on the attempt.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// The single domain this executor handles.
    fn domain(&self) -> DomainType;

    /// Identity recorded on each attempt.
    fn name(&self) -> &str;

    /// Execute one attempt.
    ///
    /// Implementations should return promptly with
    /// [`ExecutionError::Cancelled`] once `cancel` fires.
    async fn execute(
        &self,
        capability: CapabilityType,
        payload: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError>;
}
