//! Assistant tool calls against the planner data
//!
//! Calls arrive as a name plus a JSON object. They are validated once into a
//! [`ToolRequest`] here, so the [`ToolExecutor`] only ever sees typed input.

mod declarations;
pub mod executor;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use declarations::declarations;
pub use executor::{BatchOutcome, ToolExecutor};

/// Date format used on the wire and as calendar keys
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Classification used when committing a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Changes application data
    Mutate,
    /// Affects the session, not the data
    Control,
}

/// A validated tool request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    CreateProject {
        name: String,
        color: Option<String>,
        details: Option<String>,
    },
    CreateTask {
        project_name: String,
        title: String,
    },
    SelectProject {
        name: String,
    },
    DeleteProject {
        name: String,
    },
    DeleteCurrentProject,
    DeleteTask {
        title: String,
    },
    ScheduleTask {
        task_title: String,
        date: NaiveDate,
    },
    RemoveTaskFromCalendar {
        task_title: String,
        date: NaiveDate,
    },
    EndSession,
    /// Unknown tool or bad arguments; answered with an error status
    Invalid {
        reason: String,
    },
}

#[derive(Deserialize)]
struct CreateProjectArgs {
    name: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskArgs {
    project_name: String,
    title: String,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct TitleArgs {
    title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarArgs {
    task_title: String,
    date: String,
}

type ParseResult = std::result::Result<ToolRequest, String>;

impl ToolRequest {
    /// Validate a wire tool call
    #[must_use]
    pub fn parse(name: &str, arguments: &Value) -> Self {
        Self::try_parse(name, arguments).unwrap_or_else(|reason| Self::Invalid { reason })
    }

    fn try_parse(name: &str, arguments: &Value) -> ParseResult {
        match name {
            "createProject" => {
                let a: CreateProjectArgs = args(name, arguments)?;
                Ok(Self::CreateProject {
                    name: required("name", a.name)?,
                    color: a.color.filter(|c| !c.trim().is_empty()),
                    details: a.details,
                })
            }
            "createTask" => {
                let a: CreateTaskArgs = args(name, arguments)?;
                Ok(Self::CreateTask {
                    project_name: required("projectName", a.project_name)?,
                    title: required("title", a.title)?,
                })
            }
            "selectProject" => {
                let a: NameArgs = args(name, arguments)?;
                Ok(Self::SelectProject {
                    name: required("name", a.name)?,
                })
            }
            "deleteProject" => {
                let a: NameArgs = args(name, arguments)?;
                Ok(Self::DeleteProject {
                    name: required("name", a.name)?,
                })
            }
            "deleteCurrentProject" => Ok(Self::DeleteCurrentProject),
            "deleteTask" => {
                let a: TitleArgs = args(name, arguments)?;
                Ok(Self::DeleteTask {
                    title: required("title", a.title)?,
                })
            }
            "scheduleTask" => {
                let a: CalendarArgs = args(name, arguments)?;
                Ok(Self::ScheduleTask {
                    task_title: required("taskTitle", a.task_title)?,
                    date: parse_date(&a.date)?,
                })
            }
            "removeTaskFromCalendar" => {
                let a: CalendarArgs = args(name, arguments)?;
                Ok(Self::RemoveTaskFromCalendar {
                    task_title: required("taskTitle", a.task_title)?,
                    date: parse_date(&a.date)?,
                })
            }
            "endSession" => Ok(Self::EndSession),
            other => Err(format!("unknown tool: {other}")),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ToolKind {
        match self {
            Self::EndSession | Self::Invalid { .. } => ToolKind::Control,
            _ => ToolKind::Mutate,
        }
    }
}

fn args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> std::result::Result<T, String> {
    let arguments = if arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|e| format!("invalid arguments for {tool}: {e}"))
}

fn required(field: &str, value: String) -> std::result::Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn parse_date(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
        .map_err(|_| format!("invalid date '{value}', expected YYYY-MM-DD"))
}

/// A tool call as issued by the assistant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub request: ToolRequest,
}

impl ToolCall {
    /// Validate a wire call into a typed one
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        let name = name.into();
        let request = ToolRequest::parse(&name, arguments);
        if let ToolRequest::Invalid { reason } = &request {
            tracing::warn!(tool = %name, reason = %reason, "invalid tool call");
        }
        Self {
            id: id.into(),
            name,
            request,
        }
    }
}

/// Answer to one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: Value,
}

impl ToolResult {
    /// Result carrying only a status message
    #[must_use]
    pub fn status(call: &ToolCall, status: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result: serde_json::json!({ "status": status.into() }),
        }
    }

    /// Status message, if present
    #[must_use]
    pub fn status_text(&self) -> Option<&str> {
        self.result.get("status").and_then(Value::as_str)
    }
}
