use crate::models::ThreadEntry;
use crate::store::Store;
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;

/// Read-only capability for producing the thread section of a prompt
///
/// The prompt builder needs the rendered thread but must not depend on the
/// engine; this narrow interface breaks that cycle.
#[async_trait]
pub trait ThreadView: Send + Sync {
    /// Renders the given date's entries within `budget_chars`; a
    /// non-positive budget yields an empty thread.
    async fn render_for_date(
        &self,
        store: &Store,
        date: NaiveDate,
        budget_chars: i64,
    ) -> Result<String>;
}

/// Default markdown renderer over stored thread entries
#[derive(Debug, Clone, Default)]
pub struct Renderer;

#[async_trait]
impl ThreadView for Renderer {
    async fn render_for_date(
        &self,
        store: &Store,
        date: NaiveDate,
        budget_chars: i64,
    ) -> Result<String> {
        if budget_chars <= 0 {
            return Ok(String::new());
        }
        let entries = store.list_thread_by_date(date).await?;
        Ok(render_with_budget(&entries, budget_chars))
    }
}

/// Produces the markdown rendering of a set of thread entries.
///
/// Each entry becomes a `## HH:MM — summary [agent, skill]` header, an
/// optional quoted user-input line, and a summary bullet. When entries span
/// more than one machine, every header carries the machine tag so the
/// rendering stays uniform.
pub fn render(entries: &[ThreadEntry]) -> String {
    let machines: HashSet<&str> = entries.iter().map(|e| e.machine_id.as_str()).collect();
    let tag_machines = machines.len() > 1;

    let blocks: Vec<String> = entries
        .iter()
        .map(|entry| render_entry(entry, tag_machines))
        .collect();
    blocks.join("\n\n")
}

/// Renders within a character budget by dropping oldest entries first.
///
/// A non-positive budget renders everything. If even the newest entry alone
/// exceeds the budget it is returned as-is.
pub fn render_with_budget(entries: &[ThreadEntry], budget_chars: i64) -> String {
    if budget_chars <= 0 {
        return render(entries);
    }
    let mut start = 0;
    loop {
        let rendered = render(&entries[start..]);
        if rendered.len() as i64 <= budget_chars || start + 1 >= entries.len() {
            return rendered;
        }
        start += 1;
    }
}

fn render_entry(entry: &ThreadEntry, tag_machine: bool) -> String {
    let time = entry.timestamp.format("%H:%M");
    let agent = entry.agent.as_deref().unwrap_or("unknown");
    let skill = entry.skill.as_deref().unwrap_or("ad-hoc");

    let mut block = if tag_machine {
        format!(
            "## {time} — {} [{agent}, {skill}, {}]",
            entry.summary, entry.machine_id
        )
    } else {
        format!("## {time} — {} [{agent}, {skill}]", entry.summary)
    };
    if let Some(user_input) = &entry.user_input {
        block.push_str(&format!("\n> User: \"{user_input}\""));
    }
    block.push_str(&format!("\n- {}", entry.summary));
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(hour: u32, minute: u32, machine: &str, summary: &str) -> ThreadEntry {
        ThreadEntry {
            id: 0,
            timestamp: Utc.with_ymd_and_hms(2026, 2, 7, hour, minute, 0).unwrap(),
            machine_id: machine.to_string(),
            task_id: None,
            agent: Some("mock".to_string()),
            skill: None,
            user_input: None,
            summary: summary.to_string(),
            tokens_used: None,
        }
    }

    #[test]
    fn renders_header_and_bullet() {
        let rendered = render(&[entry(9, 15, "mac", "checked the build")]);
        assert_eq!(
            rendered,
            "## 09:15 — checked the build [mock, ad-hoc]\n- checked the build"
        );
    }

    #[test]
    fn renders_user_input_line_and_skill_name() {
        let mut e = entry(9, 15, "mac", "reviewed");
        e.skill = Some("morning-review".to_string());
        e.user_input = Some("how did it go?".to_string());
        let rendered = render(&[e]);
        assert_eq!(
            rendered,
            "## 09:15 — reviewed [mock, morning-review]\n> User: \"how did it go?\"\n- reviewed"
        );
    }

    #[test]
    fn multi_machine_entries_all_carry_machine_tags() {
        let rendered = render(&[
            entry(8, 0, "mac", "one"),
            entry(9, 0, "wsl", "two"),
        ]);
        assert!(rendered.contains("[mock, ad-hoc, mac]"));
        assert!(rendered.contains("[mock, ad-hoc, wsl]"));
    }

    #[test]
    fn single_machine_entries_omit_machine_tags() {
        let rendered = render(&[
            entry(8, 0, "mac", "one"),
            entry(9, 0, "mac", "two"),
        ]);
        assert!(!rendered.contains(", mac]"));
    }

    #[test]
    fn budget_drops_oldest_first() {
        let entries = vec![
            entry(8, 0, "mac", "oldest"),
            entry(9, 0, "mac", "middle"),
            entry(10, 0, "mac", "newest"),
        ];
        let full = render(&entries);

        let fits = render_with_budget(&entries, full.len() as i64);
        assert_eq!(fits, full);

        let trimmed = render_with_budget(&entries, full.len() as i64 - 1);
        assert!(!trimmed.contains("oldest"));
        assert!(trimmed.contains("newest"));
    }

    #[test]
    fn oversized_newest_entry_is_returned_as_is() {
        let entries = vec![
            entry(8, 0, "mac", "oldest"),
            entry(9, 0, "mac", "a rather long newest summary"),
        ];
        let rendered = render_with_budget(&entries, 5);
        assert!(rendered.contains("newest summary"));
        assert!(!rendered.contains("oldest"));
    }

    #[test]
    fn non_positive_budget_renders_all() {
        let entries = vec![entry(8, 0, "mac", "one"), entry(9, 0, "mac", "two")];
        assert_eq!(render_with_budget(&entries, 0), render(&entries));
        assert_eq!(render_with_budget(&entries, -5), render(&entries));
    }

    #[test]
    fn empty_entries_render_empty() {
        assert_eq!(render(&[]), "");
    }
}
