//! Tool executor: applies tool calls to a data snapshot
//!
//! Pure and synchronous. Each call works on the snapshot left by the call
//! before it, so a batch chains without anything outside observing the
//! intermediate states.

use chrono::NaiveDate;
use serde_json::json;

use super::{DATE_FORMAT, ToolCall, ToolKind, ToolRequest, ToolResult};
use crate::model::{DataSnapshot, Project, Task};
use crate::{Error, Result};

/// Status prefix for calls that could not be carried out
pub const ERROR_STATUS: &str = "error executing command";

/// Snapshot and results after a whole batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub snapshot: DataSnapshot,
    /// One result per call, in call order
    pub results: Vec<ToolResult>,
    /// Whether each call changed the snapshot, in call order
    pub changed: Vec<bool>,
    /// An `endSession` call was part of the batch
    pub end_session: bool,
}

/// Executes tool calls against the planner data
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolExecutor;

impl ToolExecutor {
    /// Apply one call, returning the next snapshot and the call's result
    ///
    /// A call that fails leaves the snapshot as it was.
    #[must_use]
    pub fn apply(self, call: &ToolCall, state: DataSnapshot) -> (DataSnapshot, ToolResult) {
        let mut next = state.clone();
        match execute(&call.request, &mut next) {
            Ok(result) => {
                tracing::debug!(tool = %call.name, id = %call.id, "tool call applied");
                let mut payload = json!({ "status": result.status });
                if let Some(id) = result.created_id {
                    payload["id"] = json!(id);
                }
                let result = ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result: payload,
                };
                (next, result)
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, id = %call.id, error = %e, "tool call failed");
                (state, ToolResult::status(call, error_status(&e)))
            }
        }
    }

    /// Apply a batch in order against one snapshot
    #[must_use]
    pub fn apply_batch(self, calls: &[ToolCall], snapshot: DataSnapshot) -> BatchOutcome {
        let mut snapshot = snapshot;
        let mut results = Vec::with_capacity(calls.len());
        let mut changed = Vec::with_capacity(calls.len());
        let mut end_session = false;

        for call in calls {
            if call.request == ToolRequest::EndSession {
                end_session = true;
            }
            let before = (call.request.kind() == ToolKind::Mutate).then(|| snapshot.clone());
            let (next, result) = self.apply(call, snapshot);
            changed.push(before.is_some_and(|before| before != next));
            snapshot = next;
            results.push(result);
        }

        BatchOutcome {
            snapshot,
            results,
            changed,
            end_session,
        }
    }
}

/// Replace the results of calls that changed the data after their commit failed
pub fn mark_unsaved(changed: &[bool], results: &mut [ToolResult]) {
    for (result, _) in results
        .iter_mut()
        .zip(changed)
        .filter(|(_, changed)| **changed)
    {
        result.result = json!({ "status": format!("{ERROR_STATUS}: could not save changes") });
    }
}

/// Whether a result reports a failed call
#[must_use]
pub fn is_error(result: &ToolResult) -> bool {
    result
        .status_text()
        .is_some_and(|s| s.starts_with(ERROR_STATUS))
}

fn error_status(e: &Error) -> String {
    match e {
        Error::ToolExecution(reason) => format!("{ERROR_STATUS}: {reason}"),
        other => format!("{ERROR_STATUS}: {other}"),
    }
}

struct Applied {
    status: String,
    created_id: Option<String>,
}

impl Applied {
    fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            created_id: None,
        }
    }

    fn created(status: impl Into<String>, id: &str) -> Self {
        Self {
            status: status.into(),
            created_id: Some(id.to_string()),
        }
    }
}

fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn execute(request: &ToolRequest, data: &mut DataSnapshot) -> Result<Applied> {
    let applied = match request {
        ToolRequest::CreateProject {
            name,
            color,
            details,
        } => {
            let project = data.add_project(Project::new(name, color.clone(), details.clone()));
            Applied::created(format!("Project '{}' created", project.name), &project.id)
        }

        ToolRequest::CreateTask {
            project_name,
            title,
        } => match data.find_project(project_name) {
            Some(pi) => {
                let id = data.add_task(pi, Task::new(title)).id.clone();
                let project = &data.projects[pi].name;
                Applied::created(format!("Task '{title}' added to project '{project}'"), &id)
            }
            None => Applied::status(format!("Project '{project_name}' not found")),
        },

        ToolRequest::SelectProject { name } => match data.find_project(name) {
            Some(pi) => {
                let project = &data.projects[pi];
                let status = format!("Project '{}' selected", project.name);
                let id = project.id.clone();
                data.selection.set(id);
                Applied::status(status)
            }
            None => Applied::status(format!("Project '{name}' not found")),
        },

        ToolRequest::DeleteProject { name } => match data.find_project(name) {
            Some(pi) => {
                let project = data.remove_project(pi);
                Applied::status(format!("Project '{}' deleted", project.name))
            }
            None => Applied::status(format!("Project '{name}' not found")),
        },

        ToolRequest::DeleteCurrentProject => {
            let selected = data
                .selection
                .id()
                .and_then(|id| data.project_index(id));
            match selected {
                Some(pi) => {
                    let project = data.remove_project(pi);
                    Applied::status(format!("Project '{}' deleted", project.name))
                }
                None => {
                    data.selection.clear();
                    Applied::status("No project is selected")
                }
            }
        }

        ToolRequest::DeleteTask { title } => match data.find_task(title) {
            Some((pi, ti)) => {
                let task = data.remove_task(pi, ti);
                Applied::status(format!("Task '{}' deleted", task.title))
            }
            None => Applied::status(format!("Task '{title}' not found")),
        },

        ToolRequest::ScheduleTask { task_title, date } => match data.find_task(task_title) {
            Some((pi, ti)) => {
                let task = &data.projects[pi].tasks[ti];
                let (id, title) = (task.id.clone(), task.title.clone());
                let key = date_key(*date);
                if data.schedule(&id, &key) {
                    Applied::status(format!("Task '{title}' scheduled for {key}"))
                } else {
                    Applied::status(format!("Task '{title}' is already scheduled for {key}"))
                }
            }
            None => Applied::status(format!("Task '{task_title}' not found")),
        },

        ToolRequest::RemoveTaskFromCalendar { task_title, date } => {
            match data.find_task(task_title) {
                Some((pi, ti)) => {
                    let task = &data.projects[pi].tasks[ti];
                    let (id, title) = (task.id.clone(), task.title.clone());
                    let key = date_key(*date);
                    if data.unschedule(&id, &key) {
                        Applied::status(format!("Task '{title}' removed from {key}"))
                    } else {
                        Applied::status(format!("Task '{title}' was not scheduled for {key}"))
                    }
                }
                None => Applied::status(format!("Task '{task_title}' not found")),
            }
        }

        ToolRequest::EndSession => Applied::status("Ending the session"),

        ToolRequest::Invalid { reason } => {
            return Err(Error::ToolExecution(reason.clone()));
        }
    };

    if !data.is_consistent() {
        return Err(Error::ToolExecution(
            "change would leave the calendar inconsistent".to_string(),
        ));
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall::new(format!("call-{name}"), name, &arguments)
    }

    fn status(result: &ToolResult) -> &str {
        result.status_text().unwrap()
    }

    #[test]
    fn create_project_returns_its_id_and_selects_it() {
        let (snapshot, result) = ToolExecutor.apply(
            &call("createProject", json!({ "name": "Acme", "color": "#ff0000" })),
            DataSnapshot::default(),
        );

        let project = &snapshot.projects[0];
        assert_eq!(project.color, "#ff0000");
        assert_eq!(snapshot.selection.id(), Some(project.id.as_str()));
        assert_eq!(result.result["id"], json!(project.id));
        assert_eq!(status(&result), "Project 'Acme' created");
    }

    #[test]
    fn create_task_in_missing_project_changes_nothing() {
        let (snapshot, result) = ToolExecutor.apply(
            &call("createTask", json!({ "projectName": "Nope", "title": "x" })),
            DataSnapshot::default(),
        );
        assert_eq!(snapshot, DataSnapshot::default());
        assert_eq!(status(&result), "Project 'Nope' not found");
    }

    #[test]
    fn select_missing_project_keeps_selection() {
        let mut data = DataSnapshot::default();
        data.add_project(Project::new("Acme", None, None));
        let before = data.selection.clone();

        let (snapshot, result) =
            ToolExecutor.apply(&call("selectProject", json!({ "name": "zzz" })), data);

        assert_eq!(snapshot.selection, before);
        assert!(status(&result).contains("not found"));
    }

    #[test]
    fn delete_current_without_selection_is_reported() {
        let mut data = DataSnapshot::default();
        data.projects.push(Project::new("Acme", None, None));

        let (snapshot, result) =
            ToolExecutor.apply(&call("deleteCurrentProject", json!({})), data.clone());

        assert_eq!(snapshot, data);
        assert_eq!(status(&result), "No project is selected");
    }

    #[test]
    fn remove_unscheduled_task_is_not_an_error() {
        let mut data = DataSnapshot::default();
        data.add_project(Project::new("Acme", None, None));
        data.add_task(0, Task::new("Draft"));

        let (_, result) = ToolExecutor.apply(
            &call(
                "removeTaskFromCalendar",
                json!({ "taskTitle": "draft", "date": "2025-01-01" }),
            ),
            data,
        );

        assert!(!is_error(&result));
        assert!(status(&result).contains("was not scheduled"));
    }

    #[test]
    fn invalid_call_becomes_error_status() {
        let (snapshot, result) =
            ToolExecutor.apply(&call("teleport", json!({})), DataSnapshot::default());
        assert_eq!(snapshot, DataSnapshot::default());
        assert!(is_error(&result));
        assert_eq!(status(&result), "error executing command: unknown tool: teleport");
    }

    #[test]
    fn mark_unsaved_only_touches_calls_that_changed_data() {
        let calls = vec![
            call("createProject", json!({ "name": "Acme" })),
            call("teleport", json!({})),
            call("endSession", json!({})),
            call("createTask", json!({ "projectName": "Nope", "title": "Plan" })),
        ];
        let mut outcome = ToolExecutor.apply_batch(&calls, DataSnapshot::default());
        assert_eq!(outcome.changed, [true, false, false, false]);

        mark_unsaved(&outcome.changed, &mut outcome.results);

        assert_eq!(
            status(&outcome.results[0]),
            "error executing command: could not save changes"
        );
        assert_eq!(
            status(&outcome.results[1]),
            "error executing command: unknown tool: teleport"
        );
        assert_eq!(status(&outcome.results[2]), "Ending the session");
        assert_eq!(status(&outcome.results[3]), "Project 'Nope' not found");
        assert!(outcome.end_session);
    }
}
