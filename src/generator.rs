//! Generator: executes a task with retrieved playbook context
//!
//! Renders the context bullets into a sectioned preamble, runs the model,
//! and records an immutable trajectory noting which bullets were in context.
//! The model call happens with no store lock held; a failure mid-task still
//! yields the partial trajectory so the reflector can learn from it.

use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::llm::LanguageModel;
use crate::types::{Bullet, Playbook, Trajectory, TrajectoryStep};

pub struct Generator {
    model: Arc<dyn LanguageModel>,
    max_tokens: u32,
}

impl Generator {
    pub fn new(model: Arc<dyn LanguageModel>, max_tokens: u32) -> Self {
        Self { model, max_tokens }
    }

    /// Run one task against the model with the given context bullets.
    /// Always returns a trajectory; a failed generation produces an empty
    /// one (steps may be partial, never fabricated).
    pub async fn execute(&self, task: &str, context: &[Bullet]) -> Trajectory {
        let started_at = Utc::now();
        let task_id = Uuid::new_v4().to_string();
        let referenced: Vec<String> = context.iter().map(|b| b.id.clone()).collect();

        let prompt = build_prompt(task, context);
        let mut steps = Vec::new();
        match self.model.generate(&prompt, self.max_tokens).await {
            Ok(result) => {
                steps.push(TrajectoryStep {
                    reasoning: String::new(),
                    action: task.to_string(),
                    tool: None,
                    result,
                    referenced_bullet_ids: referenced,
                });
            }
            Err(e) => {
                warn!("Task generation failed, recording empty trajectory: {e}");
            }
        }

        Trajectory {
            task_id,
            task: task.to_string(),
            steps,
            started_at,
        }
    }
}

fn build_prompt(task: &str, context: &[Bullet]) -> String {
    let playbook = Playbook::from_bullets(context.iter().cloned());
    let preamble = playbook.render();
    if preamble.is_empty() {
        task.to_string()
    } else {
        format!("{preamble}\nApply these insights where relevant.\n\nTask: {task}")
    }
}
