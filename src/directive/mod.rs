use crate::{PerchError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

/// When a scheduled follow-up becomes eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSpec {
    /// Relative to the moment the directive is consumed.
    Delay(Duration),
    /// An absolute RFC3339 instant.
    At(DateTime<Utc>),
}

/// A follow-up task requested by agent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleIntent {
    pub content: String,
    pub run: RunSpec,
    pub memory: Vec<String>,
    pub after: Option<String>,
}

/// A memory-document overwrite requested by agent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryIntent {
    pub file: String,
    pub content: String,
}

/// Everything extracted from one agent output
#[derive(Debug, Clone, Default)]
pub struct DirectiveBundle {
    pub schedules: Vec<ScheduleIntent>,
    pub memory_writes: Vec<MemoryIntent>,
    pub warnings: Vec<String>,
}

/// Parses `delay` duration text: `Ns`, `Nm`, `Nh`, or `Nh Nm`.
///
/// Anything else is rejected with a description of the problem.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    fn component(part: &str) -> std::result::Result<(u64, char), String> {
        let unit = part
            .chars()
            .last()
            .ok_or_else(|| "empty duration component".to_string())?;
        if !matches!(unit, 's' | 'm' | 'h') {
            return Err(format!("unknown duration unit {unit:?}"));
        }
        let digits = &part[..part.len() - 1];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid duration component {part:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration component {part:?}"))?;
        Ok((value, unit))
    }

    let parts: Vec<&str> = text.split_whitespace().collect();
    match parts.as_slice() {
        [single] => {
            let (value, unit) = component(single)?;
            Ok(match unit {
                's' => Duration::from_secs(value),
                'm' => Duration::from_secs(value * 60),
                _ => Duration::from_secs(value * 3600),
            })
        }
        [hours, minutes] => {
            let (h, hu) = component(hours)?;
            let (m, mu) = component(minutes)?;
            if hu != 'h' || mu != 'm' {
                return Err(format!("unsupported duration form {text:?}"));
            }
            Ok(Duration::from_secs(h * 3600 + m * 60))
        }
        _ => Err(format!("unsupported duration form {text:?}")),
    }
}

/// Extracts schedule and memory-write directives from agent output.
///
/// Directives are HTML-comment delimited blocks. Matching is non-greedy:
/// the inner content runs up to the first matching closer, so nested
/// openers are not supported. Malformed directives are skipped with a
/// warning; output order is preserved across both directive kinds.
pub struct DirectiveParser {
    schedule: Regex,
    memory: Regex,
    attr: Regex,
}

impl DirectiveParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            schedule: Regex::new(
                r"(?s)<!--\s*wt:schedule\b(.*?)-->(.*?)<!--\s*/wt:schedule\s*-->",
            )
            .map_err(|e| PerchError::Internal(e.into()))?,
            memory: Regex::new(r"(?s)<!--\s*wt:memory\b(.*?)-->(.*?)<!--\s*/wt:memory\s*-->")
                .map_err(|e| PerchError::Internal(e.into()))?,
            attr: Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|(\S+))"#)
                .map_err(|e| PerchError::Internal(e.into()))?,
        })
    }

    pub fn parse(&self, output: &str) -> DirectiveBundle {
        let mut bundle = DirectiveBundle::default();

        // Interleave both directive kinds in output order.
        let mut matches: Vec<(usize, bool, regex::Captures<'_>)> = Vec::new();
        for caps in self.schedule.captures_iter(output) {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            matches.push((start, true, caps));
        }
        for caps in self.memory.captures_iter(output) {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            matches.push((start, false, caps));
        }
        matches.sort_by_key(|(start, _, _)| *start);

        for (_, is_schedule, caps) in matches {
            let attrs = self.parse_attrs(caps.get(1).map_or("", |m| m.as_str()));
            let content = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            if is_schedule {
                self.consume_schedule(attrs, content, &mut bundle);
            } else {
                self.consume_memory(attrs, content, &mut bundle);
            }
        }
        bundle
    }

    /// Removes directive blocks from agent output, leaving the
    /// surrounding prose. The thread summary is taken from this text so
    /// directive markup never leaks into it.
    pub fn strip(&self, output: &str) -> String {
        let without_schedule = self.schedule.replace_all(output, "");
        self.memory.replace_all(&without_schedule, "").into_owned()
    }

    fn parse_attrs(&self, raw: &str) -> HashMap<String, String> {
        self.attr
            .captures_iter(raw)
            .map(|caps| {
                let key = caps[1].to_string();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map_or(String::new(), |m| m.as_str().to_string());
                (key, value)
            })
            .collect()
    }

    fn consume_schedule(
        &self,
        attrs: HashMap<String, String>,
        content: String,
        bundle: &mut DirectiveBundle,
    ) {
        if content.is_empty() {
            bundle
                .warnings
                .push("schedule directive has empty content, skipped".to_string());
            return;
        }

        let run = match (attrs.get("delay"), attrs.get("at")) {
            (Some(delay), _) => match parse_duration(delay) {
                Ok(parsed) => {
                    let cap =
                        Duration::from_secs(crate::constants::MAX_DIRECTIVE_DELAY_SECS);
                    if parsed > cap {
                        bundle.warnings.push(format!(
                            "schedule delay {delay:?} exceeds 24h, clamped"
                        ));
                        RunSpec::Delay(cap)
                    } else {
                        RunSpec::Delay(parsed)
                    }
                }
                Err(e) => {
                    bundle
                        .warnings
                        .push(format!("schedule directive has invalid delay: {e}, skipped"));
                    return;
                }
            },
            (None, Some(at)) => match DateTime::parse_from_rfc3339(at) {
                Ok(parsed) => RunSpec::At(parsed.with_timezone(&Utc)),
                Err(e) => {
                    bundle
                        .warnings
                        .push(format!("schedule directive has invalid at: {e}, skipped"));
                    return;
                }
            },
            (None, None) => {
                bundle.warnings.push(
                    "schedule directive missing both delay and at, skipped".to_string(),
                );
                return;
            }
        };

        let memory = attrs
            .get("memory")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        bundle.schedules.push(ScheduleIntent {
            content,
            run,
            memory,
            after: attrs.get("after").cloned(),
        });
    }

    fn consume_memory(
        &self,
        attrs: HashMap<String, String>,
        content: String,
        bundle: &mut DirectiveBundle,
    ) {
        let file = match attrs.get("file") {
            Some(file) if !file.is_empty() => file.clone(),
            _ => {
                bundle
                    .warnings
                    .push("memory directive missing file attribute, skipped".to_string());
                return;
            }
        };
        if content.is_empty() {
            bundle
                .warnings
                .push(format!("memory directive for {file:?} has empty content, skipped"));
            return;
        }
        bundle.memory_writes.push(MemoryIntent { file, content });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parser() -> DirectiveParser {
        DirectiveParser::new().unwrap()
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1h 30m").unwrap(),
            Duration::from_secs(5400)
        );

        for bad in ["", "10", "m10", "10d", "1m 30s", "soon", "1h30m"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn schedule_with_delay_and_after() {
        let output = "Deploying now.\n\
            <!-- wt:schedule delay=\"5s\" after=\"task-1\" -->\n\
            check the build status\n\
            <!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert!(bundle.warnings.is_empty());
        assert_eq!(bundle.schedules.len(), 1);
        let intent = &bundle.schedules[0];
        assert_eq!(intent.content, "check the build status");
        assert_eq!(intent.run, RunSpec::Delay(Duration::from_secs(5)));
        assert_eq!(intent.after.as_deref(), Some("task-1"));
    }

    #[test]
    fn schedule_with_at_and_memory_list() {
        let output = "<!-- wt:schedule at=\"2026-02-09T08:00:00Z\" memory=\"index, projects\" -->\n\
            follow up\n<!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        let intent = &bundle.schedules[0];
        assert_eq!(
            intent.run,
            RunSpec::At(Utc.with_ymd_and_hms(2026, 2, 9, 8, 0, 0).unwrap())
        );
        assert_eq!(intent.memory, vec!["index", "projects"]);
    }

    #[test]
    fn bareword_attributes_are_accepted() {
        let output = "<!-- wt:schedule delay=10m -->do it<!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert_eq!(
            bundle.schedules[0].run,
            RunSpec::Delay(Duration::from_secs(600))
        );
    }

    #[test]
    fn empty_content_is_skipped_with_warning() {
        let output = "<!-- wt:schedule delay=\"5s\" -->   <!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert!(bundle.schedules.is_empty());
        assert_eq!(bundle.warnings.len(), 1);
    }

    #[test]
    fn missing_delay_and_at_is_skipped_with_warning() {
        let output = "<!-- wt:schedule -->do it<!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert!(bundle.schedules.is_empty());
        assert_eq!(bundle.warnings.len(), 1);
    }

    #[test]
    fn invalid_delay_and_invalid_at_are_skipped() {
        let output = "<!-- wt:schedule delay=\"soon\" -->a<!-- /wt:schedule -->\n\
            <!-- wt:schedule at=\"tomorrow\" -->b<!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert!(bundle.schedules.is_empty());
        assert_eq!(bundle.warnings.len(), 2);
    }

    #[test]
    fn oversized_delay_is_clamped_with_warning() {
        let output = "<!-- wt:schedule delay=\"48h\" -->later<!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        assert_eq!(bundle.warnings.len(), 1);
        assert_eq!(
            bundle.schedules[0].run,
            RunSpec::Delay(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn memory_directive_requires_file_and_content() {
        let missing_file = "<!-- wt:memory -->notes<!-- /wt:memory -->";
        let bundle = parser().parse(missing_file);
        assert!(bundle.memory_writes.is_empty());
        assert_eq!(bundle.warnings.len(), 1);

        let empty = "<!-- wt:memory file=\"notes\" --> <!-- /wt:memory -->";
        let bundle = parser().parse(empty);
        assert!(bundle.memory_writes.is_empty());
        assert_eq!(bundle.warnings.len(), 1);

        let valid = "<!-- wt:memory file=\"notes\" -->new content<!-- /wt:memory -->";
        let bundle = parser().parse(valid);
        assert_eq!(bundle.memory_writes.len(), 1);
        assert_eq!(bundle.memory_writes[0].file, "notes");
        assert_eq!(bundle.memory_writes[0].content, "new content");
    }

    #[test]
    fn mixed_directives_preserve_output_order() {
        let output = "\
            <!-- wt:memory file=\"a\" -->first<!-- /wt:memory -->\n\
            <!-- wt:schedule delay=\"1s\" -->second<!-- /wt:schedule -->\n\
            <!-- wt:memory file=\"c\" -->third<!-- /wt:memory -->";
        let bundle = parser().parse(output);
        assert_eq!(bundle.memory_writes.len(), 2);
        assert_eq!(bundle.schedules.len(), 1);
        assert_eq!(bundle.memory_writes[0].content, "first");
        assert_eq!(bundle.memory_writes[1].content, "third");
    }

    #[test]
    fn nested_openers_close_at_first_closer() {
        let output = "<!-- wt:schedule delay=\"1s\" -->outer \
            <!-- wt:schedule delay=\"2s\" --> inner<!-- /wt:schedule --> tail\
            <!-- /wt:schedule -->";
        let bundle = parser().parse(output);
        // Non-greedy matching: the first closer ends the first block.
        assert_eq!(bundle.schedules.len(), 1);
        assert!(bundle.schedules[0].content.starts_with("outer"));
    }

    #[test]
    fn strip_removes_directive_blocks_and_keeps_prose() {
        let output = "Deploying now.\n\
            <!-- wt:schedule delay=\"1s\" -->check the build<!-- /wt:schedule -->\n\
            <!-- wt:memory file=\"notes\" -->new notes<!-- /wt:memory -->\n\
            All set.";
        let stripped = parser().strip(output);
        assert!(stripped.contains("Deploying now."));
        assert!(stripped.contains("All set."));
        assert!(!stripped.contains("wt:schedule"));
        assert!(!stripped.contains("check the build"));
        assert!(!stripped.contains("wt:memory"));
    }

    #[test]
    fn strip_leaves_plain_output_untouched() {
        let output = "just prose with an <!-- html comment -->";
        assert_eq!(parser().strip(output), output);
    }

    #[test]
    fn output_without_directives_yields_empty_bundle() {
        let bundle = parser().parse("just some prose with an <!-- html comment -->");
        assert!(bundle.schedules.is_empty());
        assert!(bundle.memory_writes.is_empty());
        assert!(bundle.warnings.is_empty());
    }
}
