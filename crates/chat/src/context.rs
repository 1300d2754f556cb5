//! Context injection: builds the enriched system prompt used by the
//! Chat Handler's fallback path. Search/embedding internals are out of
//! scope here — callers pass in already-ranked search hits.

const MEMORY_INSTRUCTION_BLOCK: &str = "\
To remember something about the user for future conversations, include \
`[REMEMBER: <fact>]` in your reply. To record a goal, include \
`[GOAL: <goal>]` or `[GOAL: <goal> | DEADLINE: <date>]`. To mark an \
existing goal done, include `[DONE: <search text>]`. These tags are \
stripped before the user sees your reply.";

pub struct PinnedNote {
    pub title: String,
    pub body: String,
}

pub struct SearchHit {
    pub title: String,
    pub snippet: String,
}

pub struct ThreadMessage {
    pub role: String,
    pub content: String,
}

#[derive(Default)]
pub struct ContextInputs<'a> {
    pub client_type: &'a str,
    pub user_name: Option<&'a str>,
    pub current_time: &'a str,
    pub identity: Option<&'a str>,
    pub preferences: Option<&'a str>,
    pub pinned_notes: &'a [PinnedNote],
    pub memory_record: Option<&'a str>,
    pub search_hits: &'a [SearchHit],
    pub thread_history: &'a [ThreadMessage],
}

/// Build the system prompt: sections concatenated in order, separated
/// by blank lines, with optional sections omitted entirely rather than
/// emitted empty.
pub fn build_system_prompt(inputs: &ContextInputs) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(client_preamble(inputs.client_type));

    if let Some(name) = inputs.user_name {
        sections.push(format!("You are speaking with {name}."));
    }

    sections.push(format!("Current time: {}", inputs.current_time));

    if let Some(identity) = inputs.identity {
        sections.push(identity.to_string());
    }

    if let Some(preferences) = inputs.preferences {
        sections.push(preferences.to_string());
    }

    if !inputs.pinned_notes.is_empty() {
        let mut section = String::from("Pinned notes:");
        for note in inputs.pinned_notes.iter().take(5) {
            section.push_str(&format!("\n- {}: {}", note.title, truncate_chars(&note.body, 300)));
        }
        sections.push(section);
    }

    if let Some(memory) = inputs.memory_record {
        sections.push(format!("Memory:\n{}", truncate_chars(memory, 2048)));
    }

    if !inputs.search_hits.is_empty() {
        let mut section = String::from("Relevant notes:");
        for hit in inputs.search_hits.iter().take(5) {
            section.push_str(&format!("\n- {}: {}", hit.title, hit.snippet));
        }
        sections.push(section);
    }

    if !inputs.thread_history.is_empty() {
        let mut section = String::from("Recent conversation:");
        let start = inputs.thread_history.len().saturating_sub(10);
        for msg in &inputs.thread_history[start..] {
            section.push_str(&format!("\n{}: {}", msg.role, msg.content));
        }
        sections.push(section);
    }

    sections.push(MEMORY_INSTRUCTION_BLOCK.to_string());

    sections.join("\n\n")
}

fn client_preamble(client_type: &str) -> String {
    if client_type.is_empty() {
        "You are a helpful assistant.".to_string()
    } else {
        format!("You are a helpful assistant responding over {client_type}.")
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_optional_sections_when_absent() {
        let inputs = ContextInputs {
            client_type: "whatsapp",
            current_time: "2026-08-01T12:00:00Z",
            ..Default::default()
        };
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("whatsapp"));
        assert!(!prompt.contains("You are speaking with"));
        assert!(prompt.contains("Current time: 2026-08-01T12:00:00Z"));
        assert!(prompt.contains("[REMEMBER:"));
    }

    #[test]
    fn includes_user_name_and_pinned_notes_when_present() {
        let notes = vec![PinnedNote { title: "Project X".into(), body: "details".into() }];
        let inputs = ContextInputs {
            client_type: "discord",
            user_name: Some("Ada"),
            current_time: "now",
            pinned_notes: &notes,
            ..Default::default()
        };
        let prompt = build_system_prompt(&inputs);
        assert!(prompt.contains("You are speaking with Ada."));
        assert!(prompt.contains("Project X"));
    }

    #[test]
    fn truncates_long_memory_record() {
        let long = "x".repeat(3000);
        let inputs = ContextInputs {
            client_type: "web",
            current_time: "now",
            memory_record: Some(&long),
            ..Default::default()
        };
        let prompt = build_system_prompt(&inputs);
        let memory_section = prompt.split("Memory:\n").nth(1).unwrap();
        assert!(memory_section.chars().count() < 2100);
    }
}
