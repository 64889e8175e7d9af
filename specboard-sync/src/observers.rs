//! Observers derived from synchronized content and change events.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::integrity::task_marker;
use crate::protocol::ChangeEvent;

/// Checkbox counts of the `tasks` document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    /// Completed share of all tasks, rounded down.
    pub percent: u8,
}

impl TaskProgress {
    pub fn from_markdown(content: &str) -> Self {
        let mut progress = TaskProgress::default();
        for line in content.lines() {
            match task_marker(line) {
                Some(Ok("x" | "X")) => {
                    progress.total += 1;
                    progress.completed += 1;
                }
                Some(Ok("-")) => {
                    progress.total += 1;
                    progress.in_progress += 1;
                }
                Some(Ok(" ")) => progress.total += 1,
                _ => {}
            }
        }
        if progress.total > 0 {
            progress.percent = (progress.completed * 100 / progress.total) as u8;
        }
        progress
    }
}

/// Recomputes [`TaskProgress`] whenever the tasks content changes.
#[derive(Debug, Default)]
pub struct ProgressObserver {
    last_content: Option<String>,
    progress: TaskProgress,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new progress if it differs from the previous one.
    pub fn update(&mut self, content: &str) -> Option<TaskProgress> {
        if self.last_content.as_deref() == Some(content) {
            return None;
        }
        self.last_content = Some(content.to_string());
        let progress = TaskProgress::from_markdown(content);
        if progress == self.progress {
            return None;
        }
        self.progress = progress;
        Some(progress)
    }

    pub fn progress(&self) -> TaskProgress {
        self.progress
    }
}

/// Most recently touched relative paths, most recent first, without duplicates.
#[derive(Debug)]
pub struct ContextObserver {
    limit: usize,
    recent: VecDeque<String>,
}

impl ContextObserver {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            recent: VecDeque::with_capacity(limit),
        }
    }

    /// Feed an event; only `fileChanged` events are remembered.
    pub fn observe(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::FileChanged { relative_path, .. } => {
                self.touch(relative_path);
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, relative_path: &str) {
        if self.limit == 0 {
            return;
        }
        self.recent.retain(|p| p != relative_path);
        self.recent.push_front(relative_path.to_string());
        self.recent.truncate(self.limit);
    }

    pub fn recent(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }
}
