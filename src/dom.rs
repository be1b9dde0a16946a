use anyhow::{Context, Result};
use headless_chrome::Tab;
use std::sync::Arc;

use crate::types::{MAX_PERCEIVED_ELEMENTS, Perception};

/// JavaScript injected into the page to produce the structured perception.
/// NON-DESTRUCTIVE apart from the `data-eid` markers it (re)assigns.
///
/// The script:
///   1. Drops stale `data-eid` markers from the previous perception.
///   2. Collects every visible interactive element (links, buttons, inputs,
///      ARIA widgets, contenteditable, tabindex/onclick targets) inside the
///      viewport band, in document order. Repeated labels and icon-only
///      controls are kept; each gets its own id.
///   3. Tags each with a sequential id `e0`, `e1`, ... via `data-eid`.
///   4. Counts the elements beyond `LIMIT` as truncated.
///   5. Reports whether a dialog/modal is visible.
const PERCEPTION_JS: &str = r#"
(() => {
  const LIMIT = __LIMIT__;
  document.querySelectorAll('[data-eid]').forEach(el => el.removeAttribute('data-eid'));

  const isVisible = (el) => {
    if (!el || el.nodeType !== 1) return false;
    const s = getComputedStyle(el);
    if (s.display === 'none' || s.visibility === 'hidden' || s.opacity === '0') return false;
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) return false;
    if (r.bottom < 0 || r.top > window.innerHeight * 1.5) return false;
    return true;
  };

  const SELECTOR = [
    'a', 'button', 'input', 'textarea', 'select', '[contenteditable="true"]',
    '[role="button"]', '[role="link"]', '[role="menuitem"]', '[role="tab"]',
    '[role="checkbox"]', '[role="radio"]', '[role="switch"]', '[role="option"]',
    '[role="textbox"]', '[role="combobox"]', '[role="treeitem"]',
    '[tabindex]:not([tabindex="-1"])', '[onclick]'
  ].join(',');

  const labelOf = (el) => {
    const tag = el.tagName.toLowerCase();
    if (tag === 'input' || tag === 'textarea' || tag === 'select') {
      return (el.getAttribute('aria-label') || el.placeholder || el.name || el.id || '').trim();
    }
    const icon = el.querySelector('img[alt], svg title');
    const iconLabel = icon ? (icon.getAttribute('alt') || icon.textContent || '') : '';
    return ((el.innerText || '').trim() || el.getAttribute('aria-label') || el.title || iconLabel || '').trim();
  };

  const elements = [];
  let dropped = 0;
  let id = 0;
  for (const el of document.querySelectorAll(SELECTOR)) {
    if (!isVisible(el)) continue;
    const tag = el.tagName.toLowerCase();
    const label = labelOf(el).replace(/\s+/g, ' ').slice(0, 100);
    const role = el.getAttribute('role') || (tag === 'a' ? 'link' : tag === 'button' ? 'button' : '');
    if (elements.length >= LIMIT) { dropped++; continue; }
    const eid = 'e' + (id++);
    el.setAttribute('data-eid', eid);
    const r = el.getBoundingClientRect();
    const item = {
      id: eid, tag, role, label,
      bbox: { x: r.left, y: r.top, w: r.width, h: r.height }
    };
    if (tag === 'input' || tag === 'textarea') {
      item.inputType = el.type || 'text';
      if (el.type !== 'password' && el.value) item.value = String(el.value).slice(0, 60);
    }
    elements.push(item);
  }

  const dialogOpen = Array.from(document.querySelectorAll(
    '[role="dialog"], [role="alertdialog"], [aria-modal="true"], dialog[open], .modal'
  )).some(isVisible);

  return JSON.stringify({
    url: window.location.href,
    title: document.title || '',
    elements,
    dialogOpen,
    truncated: dropped
  });
})()
"#;

/// Resolves to `{nodes, ready}` so the settle loop can compare samples.
pub const SETTLE_SAMPLE_JS: &str =
    "JSON.stringify({ nodes: document.getElementsByTagName('*').length, ready: document.readyState })";

/// Capture the structured perception of the current page.
pub fn capture_perception(tab: &Arc<Tab>) -> Result<Perception> {
    let result = tab.evaluate(&perception_script(MAX_PERCEIVED_ELEMENTS), false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    parse_perception(&raw)
}

fn perception_script(limit: usize) -> String {
    PERCEPTION_JS.replace("__LIMIT__", &limit.to_string())
}

pub fn parse_perception(raw: &str) -> Result<Perception> {
    serde_json::from_str(raw).context("perception script returned malformed JSON")
}

/// Quote a string as a JavaScript literal.
pub fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Script that clicks the first visible interactive element whose label
/// matches `text` exactly (case-insensitive). Evaluates to `true` on success.
pub fn click_by_text_js(text: &str) -> String {
    format!(
        r#"(() => {{
  const wanted = {text}.trim().toLowerCase();
  const nodes = document.querySelectorAll('a, button, [role], [tabindex], [onclick], input[type="submit"]');
  for (const el of nodes) {{
    const label = ((el.innerText || '').trim() || el.getAttribute('aria-label') || el.value || '').trim().toLowerCase();
    if (label === wanted && el.getBoundingClientRect().width > 0) {{
      el.scrollIntoView({{ block: 'center' }});
      el.click();
      return true;
    }}
  }}
  return false;
}})()"#,
        text = js_string(text)
    )
}

/// Script that focuses (and clears) the field matching `text` by label,
/// placeholder or name. Evaluates to `true` when a field was focused.
pub fn focus_field_by_text_js(text: &str) -> String {
    format!(
        r#"(() => {{
  const wanted = {text}.trim().toLowerCase();
  const nodes = document.querySelectorAll('input, textarea, [contenteditable="true"], [role="textbox"]');
  for (const el of nodes) {{
    const label = (el.getAttribute('aria-label') || el.placeholder || el.name || el.id || el.innerText || '').trim().toLowerCase();
    if (label === wanted && el.getBoundingClientRect().width > 0) {{
      el.scrollIntoView({{ block: 'center' }});
      el.focus();
      if ('value' in el) el.value = '';
      return true;
    }}
  }}
  return false;
}})()"#,
        text = js_string(text)
    )
}

/// Script that clicks (or focuses) whatever sits at a viewport point.
pub fn activate_point_js(x: f64, y: f64, focus_only: bool) -> String {
    format!(
        r#"(() => {{
  const el = document.elementFromPoint({x}, {y});
  if (!el) return false;
  if ({focus_only}) {{
    el.focus();
    if ('value' in el) el.value = '';
  }} else {{
    el.click();
  }}
  return true;
}})()"#
    )
}

pub fn contains_text_js(text: &str) -> String {
    format!(
        "(document.body && document.body.innerText || '').toLowerCase().includes({}.toLowerCase())",
        js_string(text)
    )
}
