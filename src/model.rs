//! Application data: projects, tasks, the calendar, and the current selection
//!
//! A [`DataSnapshot`] is a plain value. Mutations happen on a working copy and
//! are committed as a whole through [`crate::store::SharedState`].

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Color assigned to projects created without one
pub const DEFAULT_PROJECT_COLOR: &str = "#4f46e5";

/// Calendar entries: ISO date (`YYYY-MM-DD`) to ordered task ids
pub type Calendar = BTreeMap<String, Vec<String>>;

/// A task inside a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub done: bool,
}

impl Task {
    /// Create a task with a fresh id
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            done: false,
        }
    }
}

/// A project and its ordered tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Project {
    /// Create an empty project with a fresh id
    #[must_use]
    pub fn new(name: impl Into<String>, color: Option<String>, details: Option<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            color: color.unwrap_or_else(|| DEFAULT_PROJECT_COLOR.to_string()),
            details: details.unwrap_or_default(),
            tasks: Vec::new(),
        }
    }
}

/// Weak reference to the currently expanded project
///
/// Holds an id, never the project itself. Cleared when the project goes away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionRef(Option<String>);

impl SelectionRef {
    /// Id of the selected project, if any
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn set(&mut self, project_id: impl Into<String>) {
        self.0 = Some(project_id.into());
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Clear the selection if it points at `project_id`
    pub fn clear_if(&mut self, project_id: &str) {
        if self.0.as_deref() == Some(project_id) {
            self.0 = None;
        }
    }
}

/// Copy of all application data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSnapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub calendar: Calendar,
    #[serde(default)]
    pub selection: SelectionRef,
}

impl DataSnapshot {
    /// Index of the first project whose name contains `query`, ignoring case
    #[must_use]
    pub fn find_project(&self, query: &str) -> Option<usize> {
        self.projects.iter().position(|p| fuzzy_contains(&p.name, query))
    }

    /// Index of the project with exactly this id
    #[must_use]
    pub fn project_index(&self, id: &str) -> Option<usize> {
        self.projects.iter().position(|p| p.id == id)
    }

    /// The project the selection points at, if it still exists
    #[must_use]
    pub fn selected_project(&self) -> Option<&Project> {
        self.selection
            .id()
            .and_then(|id| self.projects.iter().find(|p| p.id == id))
    }

    /// Position of the first task whose title contains `query`, ignoring case
    ///
    /// Projects are scanned in list order, then tasks in list order.
    #[must_use]
    pub fn find_task(&self, query: &str) -> Option<(usize, usize)> {
        self.projects.iter().enumerate().find_map(|(pi, project)| {
            project
                .tasks
                .iter()
                .position(|t| fuzzy_contains(&t.title, query))
                .map(|ti| (pi, ti))
        })
    }

    /// Look up a task by id
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.projects
            .iter()
            .flat_map(|p| p.tasks.iter())
            .find(|t| t.id == id)
    }

    /// Append a project and select it
    pub fn add_project(&mut self, project: Project) -> &Project {
        self.selection.set(project.id.clone());
        self.projects.push(project);
        &self.projects[self.projects.len() - 1]
    }

    /// Append a task to the project at `project_idx`
    ///
    /// # Panics
    ///
    /// Panics if `project_idx` is out of bounds
    pub fn add_task(&mut self, project_idx: usize, task: Task) -> &Task {
        let tasks = &mut self.projects[project_idx].tasks;
        tasks.push(task);
        &tasks[tasks.len() - 1]
    }

    /// Remove a project, its calendar entries, and any selection of it
    pub fn remove_project(&mut self, project_idx: usize) -> Project {
        let project = self.projects.remove(project_idx);
        let ids: HashSet<&str> = project.tasks.iter().map(|t| t.id.as_str()).collect();
        purge_calendar(&mut self.calendar, &ids);
        self.selection.clear_if(&project.id);
        project
    }

    /// Remove a task and every calendar entry pointing at it
    pub fn remove_task(&mut self, project_idx: usize, task_idx: usize) -> Task {
        let task = self.projects[project_idx].tasks.remove(task_idx);
        let ids = HashSet::from([task.id.as_str()]);
        purge_calendar(&mut self.calendar, &ids);
        task
    }

    /// Put a task on a date; returns false if it was already there
    pub fn schedule(&mut self, task_id: &str, date: &str) -> bool {
        let entries = self.calendar.entry(date.to_string()).or_default();
        if entries.iter().any(|id| id == task_id) {
            return false;
        }
        entries.push(task_id.to_string());
        true
    }

    /// Take a task off a date; returns false if it was not there
    pub fn unschedule(&mut self, task_id: &str, date: &str) -> bool {
        let Some(entries) = self.calendar.get_mut(date) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|id| id != task_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.calendar.remove(date);
        }
        removed
    }

    /// Whether every calendar reference resolves and project ids are unique
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut project_ids = HashSet::new();
        if !self.projects.iter().all(|p| project_ids.insert(p.id.as_str())) {
            return false;
        }
        let task_ids: HashSet<&str> = self
            .projects
            .iter()
            .flat_map(|p| p.tasks.iter().map(|t| t.id.as_str()))
            .collect();
        self.calendar
            .values()
            .flatten()
            .all(|id| task_ids.contains(id.as_str()))
    }
}

fn purge_calendar(calendar: &mut Calendar, ids: &HashSet<&str>) {
    if ids.is_empty() {
        return;
    }
    calendar.retain(|_, entries| {
        entries.retain(|id| !ids.contains(id.as_str()));
        !entries.is_empty()
    });
}

/// Case-insensitive substring match used for spoken names
#[must_use]
pub fn fuzzy_contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(names: &[&str]) -> DataSnapshot {
        let mut snapshot = DataSnapshot::default();
        for name in names {
            snapshot.add_project(Project::new(*name, None, None));
        }
        snapshot
    }

    #[test]
    fn find_project_is_case_insensitive_first_match() {
        let snapshot = snapshot_with(&["Acme Website", "Acme App", "Garden"]);
        assert_eq!(snapshot.find_project("acme"), Some(0));
        assert_eq!(snapshot.find_project("APP"), Some(1));
        assert_eq!(snapshot.find_project("kitchen"), None);
    }

    #[test]
    fn add_project_selects_it() {
        let mut snapshot = snapshot_with(&["One"]);
        let id = snapshot.add_project(Project::new("Two", None, None)).id.clone();
        assert_eq!(snapshot.selection.id(), Some(id.as_str()));
        assert_eq!(snapshot.projects[1].color, DEFAULT_PROJECT_COLOR);
    }

    #[test]
    fn remove_project_purges_calendar_and_selection() {
        let mut snapshot = snapshot_with(&["P", "Q"]);
        let t1 = snapshot.add_task(0, Task::new("first")).id.clone();
        let t2 = snapshot.add_task(1, Task::new("second")).id.clone();
        snapshot.schedule(&t1, "2025-01-01");
        snapshot.schedule(&t2, "2025-01-01");
        snapshot.schedule(&t1, "2025-01-02");
        snapshot.selection.set(snapshot.projects[0].id.clone());

        snapshot.remove_project(0);

        assert_eq!(snapshot.calendar.get("2025-01-01"), Some(&vec![t2]));
        assert!(!snapshot.calendar.contains_key("2025-01-02"));
        assert_eq!(snapshot.selection.id(), None);
        assert!(snapshot.is_consistent());
    }

    #[test]
    fn schedule_is_idempotent() {
        let mut snapshot = snapshot_with(&["P"]);
        let id = snapshot.add_task(0, Task::new("x")).id.clone();
        assert!(snapshot.schedule(&id, "2025-01-01"));
        assert!(!snapshot.schedule(&id, "2025-01-01"));
        assert_eq!(snapshot.calendar["2025-01-01"].len(), 1);
    }

    #[test]
    fn unschedule_missing_entry_is_not_an_error() {
        let mut snapshot = snapshot_with(&["P"]);
        assert!(!snapshot.unschedule("nope", "2025-01-01"));
        assert!(snapshot.calendar.is_empty());
    }

    #[test]
    fn dangling_calendar_reference_is_inconsistent() {
        let mut snapshot = snapshot_with(&["P"]);
        snapshot.schedule("ghost", "2025-03-03");
        assert!(!snapshot.is_consistent());
    }
}
