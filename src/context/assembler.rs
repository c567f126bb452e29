//! Prompt assembly: the four `context_assemble` enrichment handlers.
//!
//! Each handler appends a bracketed section to the system message of the
//! assembled context. Handlers never mutate shared state; they transform the
//! accumulator they are handed. The prompt mode decides which sections are
//! produced:
//!
//! | section          | none | minimal | full |
//! |------------------|------|---------|------|
//! | available-tools  |  —   |   yes   | yes  |
//! | available-skills |  —   |   —     | yes  |
//! | runtime-info     |  —   |   yes   | yes  |
//! | bootstrap files  |  —   | SOUL.md, IDENTITY.md | all configured |

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    hooks::{HookEvent, HookHandle, HookPayload, HookRegistry},
    tools::ToolRegistry,
};

// Handler priorities within `context_assemble`.
const TOOLS_PRIORITY: i32 = 20;
const SKILLS_PRIORITY: i32 = 30;
const RUNTIME_PRIORITY: i32 = 40;
const BOOTSTRAP_PRIORITY: i32 = 50;

/// Bootstrap files always loaded in `minimal` mode.
const MINIMAL_BOOTSTRAP: [&str; 2] = ["SOUL.md", "IDENTITY.md"];

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    None,
    Minimal,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssemblerConfig {
    pub mode: PromptMode,
    /// Bootstrap filenames, loaded from the agent directory in list order.
    pub bootstrap_files: Vec<String>,
    pub max_chars_per_file: usize,
    pub max_total_chars: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            mode: PromptMode::Full,
            bootstrap_files: vec![
                "SOUL.md".into(),
                "IDENTITY.md".into(),
                "GUIDELINES.md".into(),
            ],
            max_chars_per_file: 16_000,
            max_total_chars: 48_000,
        }
    }
}

/// A skill advertised to the model in `full` mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkillRef {
    pub name: String,
    pub description: String,
}

/// Host facts rendered into the `runtime-info` section.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub os: String,
    pub model: String,
    pub timezone: String,
    pub repo_root: String,
    pub agent_id: String,
    pub agent_name: String,
}

// ─── PromptAssembler ─────────────────────────────────────────────────────────

/// Registers the enrichment handlers for one agent.
pub struct PromptAssembler {
    config: AssemblerConfig,
    agent_dir: PathBuf,
    tools: Arc<Mutex<ToolRegistry>>,
    skills: Vec<SkillRef>,
    runtime: RuntimeInfo,
}

impl PromptAssembler {
    pub fn new(
        config: AssemblerConfig,
        agent_dir: impl Into<PathBuf>,
        tools: Arc<Mutex<ToolRegistry>>,
        skills: Vec<SkillRef>,
        runtime: RuntimeInfo,
    ) -> Self {
        Self {
            config,
            agent_dir: agent_dir.into(),
            tools,
            skills,
            runtime,
        }
    }

    /// Register the handlers implied by the prompt mode; returns their
    /// handles for disposal at terminate.
    pub fn register(self, hooks: &HookRegistry) -> Vec<HookHandle> {
        let mode = self.config.mode;
        if mode == PromptMode::None {
            return Vec::new();
        }

        let mut handles = Vec::new();

        // available-tools (20)
        let tools = self.tools.clone();
        handles.push(hooks.register(
            HookEvent::ContextAssemble,
            TOOLS_PRIORITY,
            move |payload| {
                let tools = tools.clone();
                async move {
                    Ok(append_section(payload, || {
                        let specs = match tools.lock() {
                            Ok(reg) => reg.list(),
                            Err(p) => p.into_inner().list(),
                        };
                        if specs.is_empty() {
                            return None;
                        }
                        let body: String = specs
                            .iter()
                            .map(|s| format!("- {}: {}", s.name, s.description))
                            .collect::<Vec<_>>()
                            .join("\n");
                        Some(format!("[available-tools]\n{body}"))
                    }))
                }
            },
        ));

        // available-skills (30) — full mode only
        if mode == PromptMode::Full && !self.skills.is_empty() {
            let skills = self.skills.clone();
            handles.push(hooks.register(
                HookEvent::ContextAssemble,
                SKILLS_PRIORITY,
                move |payload| {
                    let skills = skills.clone();
                    async move {
                        Ok(append_section(payload, || {
                            let body: String = skills
                                .iter()
                                .map(|s| format!("- {}: {}", s.name, s.description))
                                .collect::<Vec<_>>()
                                .join("\n");
                            Some(format!("[available-skills]\n{body}"))
                        }))
                    }
                },
            ));
        }

        // runtime-info (40) — formatted once, here.
        let runtime_section = format!(
            "[runtime-info]\nos: {}\nmodel: {}\ntimezone: {}\nrepo_root: {}\nagent_id: {}\nagent_name: {}",
            self.runtime.os,
            self.runtime.model,
            self.runtime.timezone,
            self.runtime.repo_root,
            self.runtime.agent_id,
            self.runtime.agent_name,
        );
        handles.push(hooks.register(
            HookEvent::ContextAssemble,
            RUNTIME_PRIORITY,
            move |payload| {
                let section = runtime_section.clone();
                async move { Ok(append_section(payload, || Some(section))) }
            },
        ));

        // bootstrap files (50)
        let files: Vec<String> = match mode {
            PromptMode::Minimal => self
                .config
                .bootstrap_files
                .iter()
                .filter(|f| MINIMAL_BOOTSTRAP.contains(&f.as_str()))
                .cloned()
                .collect(),
            _ => self.config.bootstrap_files.clone(),
        };
        let agent_dir = self.agent_dir.clone();
        let per_file = self.config.max_chars_per_file;
        let total = self.config.max_total_chars;
        handles.push(hooks.register(
            HookEvent::ContextAssemble,
            BOOTSTRAP_PRIORITY,
            move |payload| {
                let files = files.clone();
                let agent_dir = agent_dir.clone();
                async move {
                    let section = load_bootstrap(&agent_dir, &files, per_file, total).await;
                    Ok(append_section(payload, move || section))
                }
            },
        ));

        handles
    }
}

/// Append a section to the system message of an assembled payload.
///
/// Non-assembled payloads pass through untouched so the handlers are safe to
/// fire on any chain.
fn append_section<F>(payload: HookPayload, section: F) -> HookPayload
where
    F: FnOnce() -> Option<String>,
{
    match payload {
        HookPayload::Assembled(mut assembled) => {
            if let Some(text) = section() {
                if let Some(system) = assembled.messages.first_mut() {
                    system.content.push_str("\n\n");
                    system.content.push_str(&text);
                }
            }
            HookPayload::Assembled(assembled)
        }
        other => other,
    }
}

/// Load bootstrap files in list order, applying the per-file and total caps.
async fn load_bootstrap(
    agent_dir: &std::path::Path,
    files: &[String],
    max_chars_per_file: usize,
    max_total_chars: usize,
) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut budget = max_total_chars;

    for name in files {
        if budget == 0 {
            break;
        }
        let path = agent_dir.join(name);
        let Ok(raw) = tokio::fs::read_to_string(&path).await else {
            continue; // missing files are skipped
        };
        let original_length = raw.len();
        let limit = max_chars_per_file.min(budget);
        let (text, truncated) = truncate_chars(&raw, limit);
        budget -= text.len().min(budget);

        let mut section = format!("[bootstrap:{name}]\n{text}");
        if truncated {
            section.push_str(&format!(
                "\n[truncated: original {original_length} chars]"
            ));
        }
        sections.push(section);
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Truncate at a char boundary at or below `max_bytes`.
fn truncate_chars(s: &str, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
