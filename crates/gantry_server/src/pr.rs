//! Pull-request creation support: the agent instruction and PR-URL
//! extraction from streamed output.

use gantry_domain::{AgentEvent, AgentItem};

/// Instruction sent to the agent to commit, push, and open a PR for the
/// thread's branch. The trailing marker line is what
/// [`extract_pr_url`] keys on.
pub fn build_create_pr_instruction(branch_name: &str) -> String {
    format!(
        "You are operating in a git worktree branch for this thread.\n\
         Task:\n\
         1) Review all staged and unstaged changes.\n\
         2) Group logically and create conventional commits (feat|fix|chore|refactor|docs|test) with meaningful scope and messages.\n\
         3) Push the branch '{branch_name}' to origin and ensure upstream is set.\n\
         4) Create or update a GitHub pull request from this branch against the default base branch.\n\
         \x20  - Use a conventional title.\n\
         \x20  - Write a clear, structured description that summarizes the changes.\n\
         \n\
         Constraints:\n\
         - Prefer the GitHub CLI (gh). If a PR already exists for the branch, update it.\n\
         - Do not print secrets or token values.\n\
         \n\
         Output:\n\
         - After completion print exactly one line with: PR_URL: https://github.com/<owner>/<repo>/pull/<number>\n\
         - Do not include any other lines after the PR_URL line."
    )
}

/// Pulls a GitHub PR URL out of free text. A `PR_URL:` marker line wins
/// over any bare URL elsewhere in the text; no URL yields None.
pub fn extract_pr_url(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    for line in text.lines() {
        let line = line.trim_start();
        let Some(rest) = strip_marker(line) else {
            continue;
        };
        if let Some(url) = first_pr_url(rest) {
            return Some(url);
        }
    }
    first_pr_url(text)
}

/// Checks the payload fields a PR URL can realistically land in: agent
/// message text, command output, reasoning, error messages, and the event's
/// free-text message.
pub fn extract_pr_url_from_event(event: &AgentEvent) -> Option<String> {
    if let Some(item) = &event.item {
        let candidate = match item {
            AgentItem::AgentMessage { text, .. } | AgentItem::Reasoning { text, .. } => {
                extract_pr_url(text)
            }
            AgentItem::CommandRun {
                aggregated_output, ..
            } => extract_pr_url(aggregated_output),
            AgentItem::Error { message, .. } => extract_pr_url(message),
            _ => None,
        };
        if candidate.is_some() {
            return candidate;
        }
    }
    event
        .message
        .as_deref()
        .and_then(extract_pr_url)
}

fn strip_marker(line: &str) -> Option<&str> {
    const MARKER: &str = "PR_URL:";
    if line.len() < MARKER.len() {
        return None;
    }
    let (head, rest) = line.split_at(MARKER.len());
    head.eq_ignore_ascii_case(MARKER).then_some(rest)
}

/// First well-formed `https://github.com/<owner>/<repo>/pull/<n>` in `text`.
fn first_pr_url(text: &str) -> Option<String> {
    const NEEDLE: &str = "https://github.com/";
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(NEEDLE) {
        let start = search_from + found;
        let rest = &text[start..];
        let end = rest
            .find(|c: char| {
                c.is_whitespace() || matches!(c, '"' | '\'' | ')' | ']' | '>' | ',' | ';')
            })
            .unwrap_or(rest.len());
        let candidate = rest[..end].trim_end_matches(['.', '/']);
        if is_pr_url(candidate) {
            return Some(candidate.to_owned());
        }
        search_from = start + NEEDLE.len();
    }
    None
}

fn is_pr_url(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://github.com/") else {
        return false;
    };
    let parts: Vec<&str> = rest.split('/').collect();
    matches!(
        parts.as_slice(),
        [owner, repo, "pull", number]
            if !owner.is_empty()
                && !repo.is_empty()
                && !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_domain::EventKind;

    #[test]
    fn marker_line_wins_over_other_urls() {
        let text = "See https://github.com/acme/repo/pull/999 maybe\n\
                    PR_URL: https://github.com/acme/repo/pull/123\n\
                    trailing noise";
        assert_eq!(
            extract_pr_url(text).as_deref(),
            Some("https://github.com/acme/repo/pull/123")
        );
    }

    #[test]
    fn bare_url_is_used_when_no_marker_exists() {
        let text = "Creating pull request...\nhttps://github.com/acme/repo/pull/456\ndone";
        assert_eq!(
            extract_pr_url(text).as_deref(),
            Some("https://github.com/acme/repo/pull/456")
        );
    }

    #[test]
    fn no_url_shaped_substring_yields_none() {
        assert_eq!(extract_pr_url("No url here"), None);
        assert_eq!(extract_pr_url(""), None);
        // A GitHub URL that is not a PR does not count.
        assert_eq!(extract_pr_url("https://github.com/acme/repo/issues/5"), None);
    }

    #[test]
    fn urls_are_trimmed_of_trailing_punctuation() {
        assert_eq!(
            extract_pr_url("Done (https://github.com/acme/repo/pull/42).").as_deref(),
            Some("https://github.com/acme/repo/pull/42")
        );
    }

    #[test]
    fn marker_is_case_insensitive() {
        assert_eq!(
            extract_pr_url("pr_url: https://github.com/acme/repo/pull/8").as_deref(),
            Some("https://github.com/acme/repo/pull/8")
        );
    }

    #[test]
    fn event_extraction_checks_items_then_message() {
        let mut event = AgentEvent::item_event(
            EventKind::ItemCompleted,
            AgentItem::CommandRun {
                id: "c1".to_owned(),
                command: "gh pr create".to_owned(),
                aggregated_output: "https://github.com/acme/repo/pull/77".to_owned(),
                exit_code: Some(0),
                status: gantry_domain::ItemStatus::Completed,
            },
        );
        event.message = Some("https://github.com/acme/repo/pull/1".to_owned());
        assert_eq!(
            extract_pr_url_from_event(&event).as_deref(),
            Some("https://github.com/acme/repo/pull/77")
        );

        let plain = AgentEvent {
            message: Some("PR created: https://github.com/acme/repo/pull/789".to_owned()),
            ..AgentEvent::of_kind(EventKind::Custom)
        };
        assert_eq!(
            extract_pr_url_from_event(&plain).as_deref(),
            Some("https://github.com/acme/repo/pull/789")
        );
    }
}
