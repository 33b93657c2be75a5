use crate::error::MonitorResult;
use crate::event::CgrEvent;

/// Runs the actions attached to a threshold.
pub trait ActionExecutor: Send + Sync {
    /// # Errors
    ///
    /// Any action failure.
    fn execute(&self, tenant: &str, action_ids: &[String], event: &CgrEvent) -> MonitorResult<()>;
}

/// Logs the action ids instead of running anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogActionExecutor;

impl ActionExecutor for LogActionExecutor {
    fn execute(&self, tenant: &str, action_ids: &[String], event: &CgrEvent) -> MonitorResult<()> {
        tracing::info!(tenant, actions = ?action_ids, event = %event.id, "threshold actions triggered");
        Ok(())
    }
}
