//! Memory tag processing: scans assistant replies for three tag shapes,
//! applies the side effect each one names, and strips the tag from the
//! user-visible text.

use regex::Regex;
use std::sync::OnceLock;

const RESERVED_ENDPOINTS: &[char] = &[']', '|', '{', '}', ':'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryAction {
    Remember { fact: String },
    Goal { goal: String, deadline: Option<String> },
    Done { search_text: String },
}

fn remember_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[REMEMBER:\s*([^\]]+)\]").unwrap())
}

fn goal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[GOAL:\s*([^\]|]+?)(?:\|\s*DEADLINE:\s*([^\]]+))?\]").unwrap())
}

fn done_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[DONE:\s*([^\]]+)\]").unwrap())
}

fn is_valid_candidate(content: &str, min_len: usize) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() < min_len {
        return false;
    }
    if trimmed.chars().filter(|c| c.is_alphabetic()).count() < 3 {
        return false;
    }
    let first = trimmed.chars().next();
    let last = trimmed.chars().last();
    if first.is_some_and(|c| RESERVED_ENDPOINTS.contains(&c)) {
        return false;
    }
    if last.is_some_and(|c| RESERVED_ENDPOINTS.contains(&c)) {
        return false;
    }
    true
}

/// Scan `text` for memory tags, returning the user-visible text with
/// tags stripped and the ordered list of actions to apply.
pub fn process_memory_tags(text: &str) -> (String, Vec<MemoryAction>) {
    let mut actions = Vec::new();
    let mut cleaned = text.to_string();

    cleaned = remember_re()
        .replace_all(&cleaned, |caps: &regex::Captures| {
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if is_valid_candidate(content, 5) {
                actions.push(MemoryAction::Remember { fact: content.trim().to_string() });
                String::new()
            } else {
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .into_owned();

    cleaned = goal_re()
        .replace_all(&cleaned, |caps: &regex::Captures| {
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if is_valid_candidate(content, 5) {
                let deadline = caps.get(2).map(|m| m.as_str().trim().to_string());
                actions.push(MemoryAction::Goal { goal: content.trim().to_string(), deadline });
                String::new()
            } else {
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .into_owned();

    cleaned = done_re()
        .replace_all(&cleaned, |caps: &regex::Captures| {
            let content = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if is_valid_candidate(content, 3) {
                actions.push(MemoryAction::Done { search_text: content.trim().to_string() });
                String::new()
            } else {
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .into_owned();

    // A stripped tag leaves behind the whitespace that used to separate it
    // from its neighbors: a trailing space before a newline, a leading
    // space after one, or a doubled space where both sides met. Collapse
    // each of those before trimming the string's own ends.
    let cleaned = Regex::new(r"[ \t]+\n").unwrap().replace_all(&cleaned, "\n").into_owned();
    let cleaned = Regex::new(r"\n[ \t]+").unwrap().replace_all(&cleaned, "\n").into_owned();
    let cleaned = Regex::new(r"[ \t]{2,}").unwrap().replace_all(&cleaned, " ").into_owned();
    let cleaned = Regex::new(r"\n{3,}").unwrap().replace_all(&cleaned, "\n\n").into_owned();

    (cleaned.trim().to_string(), actions)
}

/// Render a memory record append-line for a captured action, and a
/// strike-through replacement for a matched open goal line (for
/// `[DONE:]` processing against the existing memory body).
pub fn render_remember_line(fact: &str) -> String {
    format!("- {fact}")
}

pub fn render_goal_line(goal: &str, deadline: Option<&str>) -> String {
    match deadline {
        Some(d) => format!("- [ ] {goal} (deadline: {d})"),
        None => format!("- [ ] {goal}"),
    }
}

/// Mark the first open-goal line containing `search_text` as done,
/// returning the updated body. No-op if no match is found.
pub fn apply_done(body: &str, search_text: &str) -> String {
    let needle = search_text.to_lowercase();
    let mut found = false;
    let lines: Vec<String> = body
        .lines()
        .map(|line| {
            if !found && line.trim_start().starts_with("- [ ]") && line.to_lowercase().contains(&needle) {
                found = true;
                let rest = line.trim_start().trim_start_matches("- [ ]").trim();
                format!("- [x] ~~{rest}~~")
            } else {
                line.to_string()
            }
        })
        .collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_tag_is_extracted_and_stripped() {
        let (text, actions) = process_memory_tags("Got it. [REMEMBER: likes dark roast coffee] Anything else?");
        assert_eq!(text, "Got it. Anything else?");
        assert_eq!(actions, vec![MemoryAction::Remember { fact: "likes dark roast coffee".into() }]);
    }

    #[test]
    fn worked_example_from_the_tag_reference_cleans_to_two_lines() {
        let (text, actions) = process_memory_tags(
            "Sure! [REMEMBER: User prefers concise answers]\nHere you go. [GOAL: Ship v1 | DEADLINE: 2025-06-01]",
        );
        assert_eq!(text, "Sure!\nHere you go.");
        assert_eq!(
            actions,
            vec![
                MemoryAction::Remember { fact: "User prefers concise answers".into() },
                MemoryAction::Goal { goal: "Ship v1".into(), deadline: Some("2025-06-01".into()) },
            ]
        );
    }

    #[test]
    fn goal_tag_with_deadline_is_extracted() {
        let (_, actions) = process_memory_tags("[GOAL: finish the report | DEADLINE: 2026-08-05]");
        assert_eq!(
            actions,
            vec![MemoryAction::Goal { goal: "finish the report".into(), deadline: Some("2026-08-05".into()) }]
        );
    }

    #[test]
    fn goal_tag_without_deadline_is_extracted() {
        let (_, actions) = process_memory_tags("[GOAL: learn Rust]");
        assert_eq!(actions, vec![MemoryAction::Goal { goal: "learn Rust".into(), deadline: None }]);
    }

    #[test]
    fn done_tag_is_extracted() {
        let (_, actions) = process_memory_tags("[DONE: report]");
        assert_eq!(actions, vec![MemoryAction::Done { search_text: "report".into() }]);
    }

    #[test]
    fn short_candidate_is_rejected_and_left_in_text() {
        let (text, actions) = process_memory_tags("[REMEMBER: hi]");
        assert!(actions.is_empty());
        assert_eq!(text, "[REMEMBER: hi]");
    }

    #[test]
    fn candidate_with_reserved_endpoint_is_rejected() {
        let (_, actions) = process_memory_tags("[REMEMBER: :weird start]");
        assert!(actions.is_empty());
    }

    #[test]
    fn apply_done_strikes_through_matching_goal() {
        let body = "- [ ] finish the report\n- [ ] buy milk";
        let updated = apply_done(body, "report");
        assert_eq!(updated, "- [x] ~~finish the report~~\n- [ ] buy milk");
    }
}
