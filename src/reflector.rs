//! Reflector: trajectory -> candidate insights + per-bullet verdicts
//!
//! A bounded critique loop. Iteration 1 extracts a raw insight list; each
//! further iteration merges near-duplicates, splits compound insights, and
//! generalizes wording, stopping as soon as an iteration changes nothing.
//! Generation failures hand back the last stable result; the learning path
//! degrades, it never hangs or fails the task.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ReflectorConfig;
use crate::error::{PlaybookError, Result};
use crate::llm::LanguageModel;
use crate::types::{CandidateBullet, Reflection, Section, Trajectory, Verdict, VerdictOutcome};

pub struct Reflector {
    model: Arc<dyn LanguageModel>,
    config: ReflectorConfig,
}

impl Reflector {
    pub fn new(model: Arc<dyn LanguageModel>, config: ReflectorConfig) -> Self {
        Self { model, config }
    }

    /// Reflect on a trajectory. Always returns within `max_iterations` model
    /// calls; an empty trajectory short-circuits to an empty reflection with
    /// no model call at all. Partial trajectories (cancelled or timed-out
    /// tasks) are analyzed as-is.
    pub async fn reflect(&self, trajectory: &Trajectory) -> Reflection {
        if trajectory.is_empty() {
            return Reflection::empty(trajectory.task_id.clone());
        }

        let referenced: HashSet<String> = trajectory.referenced_ids().into_iter().collect();

        // Iteration 1: raw extraction
        let mut current = match self.run_iteration(&extraction_prompt(trajectory)).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Reflection extraction failed, skipping learning: {e}");
                return Reflection::empty(trajectory.task_id.clone());
            }
        };

        // Verdicts are only meaningful against bullets the task actually saw
        current.verdicts.retain(|v| referenced.contains(&v.bullet_id));

        // Iterations 2..=max: critique until stable
        for iteration in 2..=self.config.max_iterations {
            let refined = match self.run_iteration(&critique_prompt(&current.insights)).await {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Reflection iteration {iteration} failed, keeping last stable result: {e}");
                    break;
                }
            };

            if normalized_set(&refined.insights) == normalized_set(&current.insights) {
                debug!("Reflection stable after {iteration} iterations");
                break;
            }
            current.insights = refined.insights;
        }

        current.insights.truncate(self.config.max_insights);

        Reflection {
            task_id: trajectory.task_id.clone(),
            insights: current.insights,
            verdicts: current.verdicts,
        }
    }

    async fn run_iteration(&self, prompt: &str) -> Result<ParsedReflection> {
        let text = self.model.generate(prompt, self.config.max_tokens).await?;
        extract_insights(&text)
    }
}

/// Intermediate parse result from one model call
#[derive(Debug, Clone)]
pub struct ParsedReflection {
    pub insights: Vec<CandidateBullet>,
    pub verdicts: Vec<Verdict>,
}

/// Strict schema boundary for model output. The reply must contain a JSON
/// object with an `insights` array (and optionally `verdicts`); anything
/// malformed is a `TransientGeneration`, never silently accepted.
pub fn extract_insights(text: &str) -> Result<ParsedReflection> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(PlaybookError::TransientGeneration(
                "no JSON object in model output".to_string(),
            ))
        }
    };

    let wire: WireReflection = serde_json::from_str(json)
        .map_err(|e| PlaybookError::TransientGeneration(format!("schema mismatch: {e}")))?;

    let mut insights = Vec::with_capacity(wire.insights.len());
    for item in wire.insights {
        let section = Section::parse(&item.section).ok_or_else(|| {
            PlaybookError::TransientGeneration(format!("unknown section '{}'", item.section))
        })?;
        let content = item.content.trim();
        if content.is_empty() {
            return Err(PlaybookError::TransientGeneration(
                "empty insight content".to_string(),
            ));
        }
        insights.push(CandidateBullet {
            section,
            content: content.to_string(),
        });
    }

    let mut verdicts = Vec::with_capacity(wire.verdicts.len());
    for item in wire.verdicts {
        let outcome = match item.outcome.trim().to_lowercase().as_str() {
            "helpful" => VerdictOutcome::Helpful,
            "harmful" => VerdictOutcome::Harmful,
            other => {
                return Err(PlaybookError::TransientGeneration(format!(
                    "unknown verdict outcome '{other}'"
                )))
            }
        };
        verdicts.push(Verdict {
            bullet_id: item.bullet_id,
            outcome,
        });
    }

    Ok(ParsedReflection { insights, verdicts })
}

#[derive(Debug, serde::Deserialize)]
struct WireReflection {
    insights: Vec<WireInsight>,
    #[serde(default)]
    verdicts: Vec<WireVerdict>,
}

#[derive(Debug, serde::Deserialize)]
struct WireInsight {
    section: String,
    content: String,
}

#[derive(Debug, serde::Deserialize)]
struct WireVerdict {
    bullet_id: String,
    outcome: String,
}

fn normalized_set(insights: &[CandidateBullet]) -> BTreeSet<CandidateBullet> {
    insights.iter().map(|i| i.normalized()).collect()
}

fn extraction_prompt(trajectory: &Trajectory) -> String {
    let mut steps = String::new();
    for (i, step) in trajectory.steps.iter().enumerate() {
        steps.push_str(&format!("Step {}:\n", i + 1));
        if !step.reasoning.is_empty() {
            steps.push_str(&format!("  reasoning: {}\n", step.reasoning));
        }
        steps.push_str(&format!("  action: {}\n", step.action));
        if let Some(tool) = &step.tool {
            steps.push_str(&format!("  tool: {tool}\n"));
        }
        steps.push_str(&format!("  result: {}\n", step.result));
        if !step.referenced_bullet_ids.is_empty() {
            steps.push_str(&format!(
                "  context bullets: {}\n",
                step.referenced_bullet_ids.join(", ")
            ));
        }
    }

    format!(
        "You are reviewing a completed task execution to extract reusable insights.\n\
         Task: {task}\n\n{steps}\n\
         Reply with a single JSON object:\n\
         {{\"insights\": [{{\"section\": \"strategy|api_usage|mistake|pattern|other\", \
         \"content\": \"one atomic insight\"}}], \
         \"verdicts\": [{{\"bullet_id\": \"id from context bullets\", \
         \"outcome\": \"helpful|harmful\"}}]}}\n\
         Each insight must state exactly one thing. Judge every context bullet \
         that influenced the outcome.",
        task = trajectory.task,
        steps = steps
    )
}

fn critique_prompt(insights: &[CandidateBullet]) -> String {
    let listed = serde_json::to_string_pretty(insights).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Critique and rewrite this insight list:\n{listed}\n\
         Merge near-duplicates, split any item stating more than one thing, \
         and generalize task-specific wording. If nothing needs changing, \
         return the list unchanged.\n\
         Reply with a single JSON object: {{\"insights\": [{{\"section\": \
         \"strategy|api_usage|mistake|pattern|other\", \"content\": \"...\"}}]}}"
    )
}
