use regex::Regex;
use std::sync::LazyLock;

use crate::recorder::Step;
use crate::types::{Action, WaitCondition};

// Consumers split explanations on `\d+\)`; captions must never contain it.
static NUMBERING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+\)").expect("valid regex"));
static DIGIT_PAREN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d)\)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub captions: Vec<String>,
}

impl Explanation {
    /// `"1) first\n2) second"`
    pub fn render(&self) -> String {
        self.captions
            .iter()
            .enumerate()
            .map(|(i, caption)| format!("{}) {}", i + 1, caption))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }
}

/// Inverse of [`Explanation::render`], the way downstream viewers parse it.
pub fn split_explanation(text: &str) -> Vec<String> {
    NUMBERING
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// One caption per step, in step order.
pub fn synthesize(task: &str, steps: &[Step]) -> Explanation {
    let mut captions = Vec::with_capacity(steps.len());
    let mut previous: Option<&Step> = None;
    for (i, step) in steps.iter().enumerate() {
        let is_last = i + 1 == steps.len();
        let body = describe(task, step, previous, is_last, steps.len() == 1);
        let acted = matches!(step.action, Action::Click { .. } | Action::Type { .. });
        let caption = match previous {
            Some(prev) if acted && prev.dialog_open && step.dialog_open => {
                format!("In the open dialog, {}", lowercase_first(&body))
            }
            Some(_) if acted => format!("Then {}", lowercase_first(&body)),
            _ => body,
        };
        captions.push(neutralize(&caption));
        previous = Some(step);
    }
    Explanation { captions }
}

fn describe(task: &str, step: &Step, previous: Option<&Step>, is_last: bool, only: bool) -> String {
    let target = step
        .target_label
        .as_deref()
        .map(|l| format!("\"{}\"", truncate(l, 60)))
        .unwrap_or_else(|| "the highlighted element".to_string());
    let page = page_name(step);
    let goal = task.trim().trim_end_matches(['?', '.', '!']);

    let mut caption = match &step.action {
        Action::Click { .. } => format!("Click {}{}", target, effect(step, previous)),
        Action::Type { text, .. } => {
            format!("Type \"{}\" into the {} field", truncate(text, 60), target.trim_matches('"'))
        }
        Action::Navigate { .. } => format!("Open {}", page),
        Action::Wait { condition } => match condition {
            WaitCondition::Text { text } => format!("Wait until \"{}\" appears on {}", truncate(text, 60), page),
            _ => format!("Wait for {} to finish loading", page),
        },
        Action::Finish { reason } if only => {
            format!("On {} you already have what you need for \"{}\": {}", page, goal, lowercase_first(&sentence(reason)))
        }
        Action::Finish { reason } => format!("You end up on {}. {}", page, sentence(reason)),
        Action::Fail { reason } => sentence(reason),
    };

    if is_last && !matches!(step.action, Action::Finish { .. }) && !goal.is_empty() {
        caption.push_str(&format!(". That's all it takes for \"{}\"", goal));
    }
    caption
}

fn effect(step: &Step, previous: Option<&Step>) -> String {
    match previous {
        Some(prev) if step.dialog_open && !prev.dialog_open => ", which opens a dialog".to_string(),
        Some(prev) if step.url != prev.url => format!(", which takes you to {}", page_name(step)),
        None if step.dialog_open => ", which opens a dialog".to_string(),
        None => format!(" on {}", page_name(step)),
        _ => String::new(),
    }
}

fn page_name(step: &Step) -> String {
    let title = step.title.trim();
    if title.is_empty() {
        format!("the page at {}", step.url)
    } else {
        format!("the \"{}\" page", truncate(title, 60))
    }
}

fn sentence(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "Done.".to_string();
    }
    let mut s = uppercase_first(text);
    if !s.ends_with(['.', '!', '?']) {
        s.push('.');
    }
    s
}

/// Break any `<digit>)` so positional splitting stays exact.
fn neutralize(caption: &str) -> String {
    DIGIT_PAREN.replace_all(caption, "$1 )").into_owned()
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}…", text.chars().take(max).collect::<String>())
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn uppercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::Fingerprint;

    fn step(index: usize, action: Action, title: &str, url: &str, dialog_open: bool, label: Option<&str>) -> Step {
        Step {
            index,
            path: format!("screenshots/t/step_{:03}.png", index),
            action,
            target_label: label.map(String::from),
            url: url.into(),
            title: title.into(),
            dialog_open,
            fingerprint: Fingerprint { url: url.into(), structure: index as u64, visual: Vec::new() },
        }
    }

    #[test]
    fn one_caption_per_step_and_parseable() {
        let steps = vec![
            step(0, Action::Click { target: "e1".into() }, "Settings", "https://a.test/settings", false, Some("Settings")),
            step(1, Action::Click { target: "e2".into() }, "Settings", "https://a.test/settings", true, Some("Invite (2)")),
            step(2, Action::Type { target: "e3".into(), text: "bob@x.io".into() }, "Settings", "https://a.test/settings", true, Some("Email")),
            step(3, Action::Finish { reason: "invite form ready".into() }, "Settings", "https://a.test/settings", true, None),
        ];
        let explanation = synthesize("How do I invite a teammate?", &steps);
        assert_eq!(explanation.len(), 4);
        let text = explanation.render();
        assert!(text.starts_with("1)"));
        assert_eq!(split_explanation(&text).len(), 4);
        assert!(explanation.captions[1].contains("opens a dialog"));
        assert!(explanation.captions[2].starts_with("In the open dialog"));
    }

    #[test]
    fn single_finish_step_mentions_goal() {
        let steps = vec![step(0, Action::Finish { reason: "already visible".into() }, "Members", "https://a.test/m", false, None)];
        let explanation = synthesize("How do I invite a teammate?", &steps);
        assert_eq!(explanation.len(), 1);
        assert!(explanation.captions[0].contains("\"How do I invite a teammate\""));
        assert!(explanation.render().starts_with("1) "));
    }

    #[test]
    fn numbering_inside_captions_is_neutralized() {
        assert_eq!(neutralize("Pick option 3) then 12)"), "Pick option 3 ) then 12 )");
        assert_eq!(split_explanation("1) a\n2) b 3 ) c"), vec!["a", "b 3 ) c"]);
    }
}
