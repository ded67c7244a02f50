//! Function declarations announced to the assistant at session setup

use serde_json::{Value, json};

fn function(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "name": name,
        "description": description,
        "parameters": parameters,
    })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// JSON schemas for every tool the executor understands
#[must_use]
pub fn declarations() -> Vec<Value> {
    let date = json!({ "type": "string", "description": "Date in YYYY-MM-DD format" });

    vec![
        function(
            "createProject",
            "Create a new project and select it",
            object(
                json!({
                    "name": { "type": "string" },
                    "color": { "type": "string", "description": "Hex color such as #4f46e5" },
                    "details": { "type": "string" },
                }),
                &["name"],
            ),
        ),
        function(
            "createTask",
            "Add a task to the project whose name contains projectName",
            object(
                json!({
                    "projectName": { "type": "string" },
                    "title": { "type": "string" },
                }),
                &["projectName", "title"],
            ),
        ),
        function(
            "selectProject",
            "Select (expand) the project whose name contains name",
            object(json!({ "name": { "type": "string" } }), &["name"]),
        ),
        function(
            "deleteProject",
            "Delete the project whose name contains name, with its tasks",
            object(json!({ "name": { "type": "string" } }), &["name"]),
        ),
        function(
            "deleteCurrentProject",
            "Delete the currently selected project",
            object(json!({}), &[]),
        ),
        function(
            "deleteTask",
            "Delete the first task whose title contains title",
            object(json!({ "title": { "type": "string" } }), &["title"]),
        ),
        function(
            "scheduleTask",
            "Put a task on the calendar for a date",
            object(
                json!({ "taskTitle": { "type": "string" }, "date": date }),
                &["taskTitle", "date"],
            ),
        ),
        function(
            "removeTaskFromCalendar",
            "Take a task off the calendar for a date",
            object(
                json!({ "taskTitle": { "type": "string" }, "date": date }),
                &["taskTitle", "date"],
            ),
        ),
        function(
            "endSession",
            "End the voice conversation when the user is done",
            object(json!({}), &[]),
        ),
    ]
}
