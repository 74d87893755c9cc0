// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session-start discovery: project context files and skills.

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Discovered {
    pub context_files: Vec<String>,
    pub skills: Vec<SkillInfo>,
}

const CONTEXT_FILE_CANDIDATES: &[&str] = &["AGENTS.md", ".opal/context.md", "OPAL.md"];

/// Scan a working directory for context files and `.opal/skills/*/SKILL.md`.
pub fn discover(working_dir: &Path) -> Discovered {
    let mut found = Discovered::default();

    for candidate in CONTEXT_FILE_CANDIDATES {
        if working_dir.join(candidate).is_file() {
            found.context_files.push((*candidate).to_string());
        }
    }

    let skills_dir = working_dir.join(".opal/skills");
    if let Ok(entries) = std::fs::read_dir(&skills_dir) {
        let mut skills: Vec<SkillInfo> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let manifest = e.path().join("SKILL.md");
                let text = std::fs::read_to_string(manifest).ok()?;
                Some(SkillInfo {
                    name: e.file_name().to_string_lossy().into_owned(),
                    description: first_prose_line(&text),
                })
            })
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        found.skills = skills;
    }

    found
}

/// First non-empty, non-heading line of a skill manifest.
fn first_prose_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or_default()
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
