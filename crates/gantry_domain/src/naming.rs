//! Deterministic names for worktree directories, branches, and threads.

use crate::thread::InputSegment;

pub const THREAD_TITLE_MAX_WORDS: usize = 8;
pub const UNTITLED_THREAD_TITLE: &str = "Untitled thread";

const BRANCH_PREFIX: &str = "gantry";

/// Lowercase segment safe for directory names and branch path components.
/// Falls back to "project" when nothing survives sanitization.
pub fn sanitize_slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_dash = false;

    for ch in input.chars() {
        let mapped = match ch {
            'a'..='z' | '0'..='9' => Some(ch),
            'A'..='Z' => Some(ch.to_ascii_lowercase()),
            _ => None,
        };

        match mapped {
            Some(ch) => {
                out.push(ch);
                prev_dash = false;
            }
            None => {
                if !prev_dash && !out.is_empty() {
                    out.push('-');
                    prev_dash = true;
                }
            }
        }
    }

    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() {
        "project".to_owned()
    } else {
        out
    }
}

/// Descriptive branch name for a thread, e.g. `gantry/refactor-auth-123`.
pub fn branch_for_thread(title: &str, thread_id: i64) -> String {
    format!("{BRANCH_PREFIX}/{}-{thread_id}", sanitize_slug(title))
}

/// Branch used when no title-derived name is available.
pub fn fallback_branch_for_thread(thread_id: i64) -> String {
    format!("{BRANCH_PREFIX}/thread/{thread_id}")
}

/// Directory leaf for a thread worktree, e.g. `refactor-auth-123`.
pub fn worktree_dir_suffix(title: &str, thread_id: i64) -> String {
    format!("{}-{thread_id}", sanitize_slug(title))
}

/// Short title derived from the user's first message: up to the first eight
/// words of the input, falling back to the text segments, then a placeholder.
pub fn derive_thread_title(input: &str, segments: &[InputSegment]) -> String {
    let mut text = input.trim().to_owned();
    if text.is_empty() {
        let parts: Vec<&str> = segments
            .iter()
            .filter_map(|segment| match segment {
                InputSegment::Text { text } => {
                    let trimmed = text.trim();
                    (!trimmed.is_empty()).then_some(trimmed)
                }
                InputSegment::Image { .. } => None,
            })
            .collect();
        text = parts.join(" ");
    }
    if text.is_empty() {
        return UNTITLED_THREAD_TITLE.to_owned();
    }
    text.split_whitespace()
        .take(THREAD_TITLE_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extracts a thread id from a worktree leaf directory name. Accepts a bare
/// numeric name or any name ending in digits ("refactor-auth-123").
pub fn parse_thread_id_from_dir(name: &str) -> Option<i64> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(id) = trimmed.parse::<i64>() {
        return (id > 0).then_some(id);
    }
    let digits: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() || digits.len() == trimmed.len() {
        return None;
    }
    let id = digits.parse::<i64>().ok()?;
    (id > 0).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_slug_lowercases_and_collapses_separators() {
        assert_eq!(sanitize_slug("Hello, World!"), "hello-world");
        assert_eq!(sanitize_slug("Hello---World"), "hello-world");
        assert_eq!(sanitize_slug(""), "project");
        assert_eq!(sanitize_slug("!!!"), "project");
    }

    #[test]
    fn branch_and_dir_names_are_deterministic() {
        assert_eq!(branch_for_thread("Refactor Auth", 123), "gantry/refactor-auth-123");
        assert_eq!(worktree_dir_suffix("Refactor Auth", 123), "refactor-auth-123");
        assert_eq!(fallback_branch_for_thread(7), "gantry/thread/7");
    }

    #[test]
    fn derive_thread_title_takes_first_eight_words() {
        let title = derive_thread_title(
            "Refactor the auth module across six files in total length",
            &[],
        );
        assert_eq!(title, "Refactor the auth module across six files in");
    }

    #[test]
    fn derive_thread_title_falls_back_to_text_segments() {
        let segments = vec![
            InputSegment::Image {
                image_path: "/tmp/x.png".to_owned(),
            },
            InputSegment::Text {
                text: "  look at this  ".to_owned(),
            },
        ];
        assert_eq!(derive_thread_title("", &segments), "look at this");
        assert_eq!(derive_thread_title("", &[]), UNTITLED_THREAD_TITLE);
    }

    #[test]
    fn parse_thread_id_handles_bare_and_suffixed_names() {
        assert_eq!(parse_thread_id_from_dir("123"), Some(123));
        assert_eq!(parse_thread_id_from_dir("feature-x-123"), Some(123));
        assert_eq!(parse_thread_id_from_dir("name-00012"), Some(12));
        assert_eq!(parse_thread_id_from_dir("123-feature"), None);
        assert_eq!(parse_thread_id_from_dir("abc"), None);
        assert_eq!(parse_thread_id_from_dir(""), None);
        assert_eq!(parse_thread_id_from_dir("0"), None);
    }
}
