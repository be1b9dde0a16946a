use serde::{Deserialize, Serialize};
use url::Url;

/// A single atomic action the decision policy asks the navigator to perform.
///
/// `target` values are element ids from the current [`Perception`], e.g. `"e4"`
/// (the bracketed form `"[e4]"` is accepted too).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click { target: String },
    Type { target: String, text: String },
    Navigate { url: String },
    Wait { condition: WaitCondition },
    Finish { reason: String },
    Fail { reason: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Navigate { .. } => "navigate",
            Action::Wait { .. } => "wait",
            Action::Finish { .. } => "finish",
            Action::Fail { .. } => "fail",
        }
    }

    /// Element id this action points at, normalized to `eN`.
    pub fn target(&self) -> Option<String> {
        match self {
            Action::Click { target } | Action::Type { target, .. } => Some(normalize_element_id(target)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    /// Let network and DOM settle.
    Idle,
    /// Wait until the given text is visible somewhere on the page.
    Text { text: String },
    /// Plain delay, capped by the settle timeout.
    Duration { ms: u64 },
}

/// Absolute http(s) URL with a host, or `None`.
pub fn parse_http_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let web = matches!(url.scheme(), "http" | "https") && url.host_str().is_some();
    web.then_some(url)
}

/// Strip brackets and whitespace: `" [e12] "` -> `"e12"`.
pub fn normalize_element_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }
}

/// One visible element of the page as seen by the perception script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiElement {
    pub id: String,
    pub tag: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub bbox: BoundingBox,
}

/// Bounded structured view of the current UI, fed to the decision policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Perception {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub elements: Vec<UiElement>,
    #[serde(default)]
    pub dialog_open: bool,
    /// Elements dropped because of the element budget.
    #[serde(default)]
    pub truncated: usize,
}

impl Perception {
    pub fn find(&self, element_id: &str) -> Option<&UiElement> {
        let id = normalize_element_id(element_id);
        self.elements.iter().find(|el| el.id == id)
    }

    /// Compact one-line-per-element rendering for prompts.
    pub fn render(&self, max_chars: usize) -> String {
        let mut out = format!("Page URL: {}\nTitle: {}\n", self.url, self.title);
        if self.dialog_open {
            out.push_str("A dialog is open.\n");
        }
        out.push_str("\nElements:\n");
        for el in &self.elements {
            let mut line = format!("[{}] {}", el.id, el.tag);
            if !el.role.is_empty() && el.role != el.tag {
                line.push_str(&format!(" role={}", el.role));
            }
            if let Some(kind) = &el.input_type {
                line.push_str(&format!(" type={}", kind));
            }
            if !el.label.is_empty() {
                line.push_str(&format!(" \"{}\"", el.label));
            }
            if let Some(value) = el.value.as_deref().filter(|v| !v.is_empty()) {
                line.push_str(&format!(" value=\"{}\"", value));
            }
            line.push('\n');
            if out.len() + line.len() > max_chars {
                out.push_str("... [truncated]\n");
                return out;
            }
            out.push_str(&line);
        }
        if self.truncated > 0 {
            out.push_str(&format!("... [{} more elements not shown]\n", self.truncated));
        }
        out
    }
}

/// Outcome of one navigator iteration, as reported back to the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: Action,
    pub succeeded: bool,
    pub note: String,
}

impl HistoryEntry {
    pub fn ok(action: Action, note: impl Into<String>) -> Self {
        Self { action, succeeded: true, note: note.into() }
    }

    pub fn failed(action: Action, note: impl Into<String>) -> Self {
        Self { action, succeeded: false, note: note.into() }
    }
}

/// Body of `POST /tasks/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskRequest {
    #[serde(default)]
    pub login_url: Option<String>,
    pub session_path: String,
    pub task: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskResponse {
    pub paths: Vec<String>,
    pub explanation: String,
}

/// Validated, immutable capture request.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub login_url: Option<String>,
    pub session_path: String,
}

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 6000;
pub const MAX_PERCEIVED_ELEMENTS: usize = 150;
