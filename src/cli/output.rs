//! CLI output formatting

use crate::core::{NodeExecution, PlanExecution, Status};
use crate::execution::ExecutionEvent;
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a status for display
pub fn format_status(status: Status) -> String {
    let name = status.as_str();
    match status {
        Status::Succeeded => style(name).green().to_string(),
        Status::Skipped | Status::IgnoreFailed => style(name).dim().to_string(),
        Status::Failed | Status::Errored => style(name).red().to_string(),
        Status::Aborted | Status::Expired | Status::Suspended => style(name).yellow().to_string(),
        Status::AsyncWaiting | Status::TaskWaiting | Status::InterventionWaiting => {
            style(name).blue().to_string()
        }
        _ => style(name).dim().to_string(),
    }
}

fn status_icon(status: Status) -> &'static Emoji<'static, 'static> {
    if status.is_positive() {
        &CHECK
    } else if status.is_final() {
        &CROSS
    } else if status.is_waiting() {
        &SPINNER
    } else {
        &INFO
    }
}

/// Format a plan execution for the history listing
pub fn format_plan_execution(execution: &PlanExecution) -> String {
    let duration = execution
        .end_ts
        .and_then(|end| end.signed_duration_since(execution.start_ts).to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} {} - {} - {} - {} - {}",
        status_icon(execution.status),
        style(short_id(&execution.id)).dim(),
        style(&execution.plan_id).bold(),
        format_status(execution.status),
        style(execution.start_ts.format("%Y-%m-%d %H:%M:%S")).dim(),
        style(duration).cyan()
    )
}

/// Format one node execution as an indented tree line
pub fn format_node_execution(node: &NodeExecution) -> String {
    let indent = "  ".repeat(node.ambiance.levels.len());
    let attempt = if node.retry_index() > 0 {
        format!(" (attempt {})", node.retry_index() + 1)
    } else {
        String::new()
    };
    let cause = node
        .cause
        .as_deref()
        .filter(|_| !node.status.is_positive())
        .map(|cause| format!(": {}", style(cause).dim()))
        .unwrap_or_default();

    format!(
        "{}{} {}{} {}{}",
        indent,
        status_icon(node.status),
        style(&node.node.identifier).cyan(),
        style(attempt).dim(),
        format_status(node.status),
        cause
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStart { ambiance, .. } => format!(
            "{} Starting plan {} ({})",
            ROCKET,
            style(&ambiance.plan_id).bold(),
            style(short_id(&ambiance.plan_execution_id)).dim()
        ),
        ExecutionEvent::PipelineEnd { ambiance, status, .. } => format!(
            "{} Plan {} ({}) finished {}",
            status_icon(*status),
            style(&ambiance.plan_id).bold(),
            style(short_id(&ambiance.plan_execution_id)).dim(),
            format_status(*status)
        ),
        ExecutionEvent::PipelineAbort { ambiance, .. } => format!(
            "{} Plan {} was aborted",
            WARN,
            style(&ambiance.plan_id).bold()
        ),
        ExecutionEvent::PipelineTimeout { ambiance, .. } => format!(
            "{} Plan {} timed out",
            WARN,
            style(&ambiance.plan_id).bold()
        ),
        ExecutionEvent::StageStart { ambiance, .. } => format!(
            "{} Stage {}",
            ROCKET,
            style(ambiance.step_identifier().unwrap_or("?")).bold()
        ),
        ExecutionEvent::StageEnd { ambiance, status, .. } => format!(
            "{} Stage {} {}",
            status_icon(*status),
            style(ambiance.step_identifier().unwrap_or("?")).bold(),
            format_status(*status)
        ),
        ExecutionEvent::NodeStatusChanged { ambiance, status, .. } => format!(
            "{}{} {} {}",
            "  ".repeat(ambiance.levels.len().saturating_sub(1)),
            status_icon(*status),
            style(ambiance.step_identifier().unwrap_or("?")).cyan(),
            format_status(*status)
        ),
    }
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}.{:01}s", secs, duration.subsec_millis() / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
