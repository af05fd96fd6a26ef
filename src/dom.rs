use anyhow::Result;
use headless_chrome::Tab;
use serde::Deserialize;
use std::sync::Arc;

use crate::types::Observation;

pub const MAX_ELEMENTS: usize = 150;
pub const MAX_TEXT_CHARS: usize = 6000;

/// JavaScript injected into the page to produce a simplified DOM representation.
/// Reads the DOM without modifying styles or layout.
///
/// The script:
///   1. Skips script, style, noscript, svg elements.
///   2. Walks the visible DOM tree (max depth 25; dashboards nest deeply).
///   3. Assigns sequential IDs [e0], [e1], ... to interactive elements
///      via data-eid attributes, including role=tab/button switchers.
///   4. Returns `{"elements": [...], "text": [...]}` as a JSON string.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  const INTERACTIVE = ['a','button','input','textarea','select'];
  const ROLES = ['button','tab','switch','link','menuitem'];
  let id = 0;
  const elements = [];
  const text = [];
  const seen = new Set();

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function label(el) {
    return (el.getAttribute('aria-label') || el.textContent || '').trim().replace(/\s+/g, ' ').slice(0, 60);
  }

  function walk(node, depth) {
    if (depth > 25) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      const role = child.getAttribute('role');
      const interactive = INTERACTIVE.includes(tag) || (role && ROLES.includes(role));

      if (interactive) {
        const eid = '[e' + (id++) + ']';
        child.setAttribute('data-eid', eid);
        let desc = '';
        if (tag === 'a') {
          desc = eid + ' link "' + label(child) + '"';
        } else if (tag === 'input' || tag === 'textarea') {
          desc = eid + ' ' + tag + ' type=' + (child.type||'text') + ' placeholder="' + (child.placeholder||'') + '"';
          if (child.name) desc += ' name=' + child.name;
          if (child.value) desc += ' value="' + child.value.slice(0,30) + '"';
        } else if (tag === 'select') {
          const opts = [...child.options].map(o => o.text.trim().slice(0,20)).join('|');
          desc = eid + ' select [' + opts + ']';
        } else {
          desc = eid + ' ' + (role || tag) + ' "' + label(child) + '"';
        }
        elements.push(desc);
      } else {
        const t = child.textContent ? child.textContent.trim() : '';
        if (t && t.length < 200 && child.children.length === 0) {
          const line = t.slice(0, 120);
          if (!seen.has(line)) {
            seen.add(line);
            text.push(line);
          }
        }
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify({ elements, text });
})()
"#;

const READY_JS: &str = "document.readyState === 'complete' && !!document.body";

#[derive(Debug, Default, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    elements: Vec<String>,
    #[serde(default)]
    text: Vec<String>,
}

/// Capture an observation from the current page.
pub fn capture_observation(tab: &Arc<Tab>) -> Result<Observation> {
    let result = tab.evaluate(SNAPSHOT_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();

    let url = get_current_url(tab).unwrap_or_else(|_| tab.get_url());
    let title = get_page_title(tab).unwrap_or_else(|_| "untitled".to_string());
    Ok(parse_snapshot(&raw, url, title))
}

/// Whether the document finished loading.
pub fn page_ready(tab: &Arc<Tab>) -> Result<bool> {
    let result = tab.evaluate(READY_JS, false)?;
    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Get the current page URL.
pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Get the current page title.
pub fn get_page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}

/// CSS selector for an element reference such as `e3` or `[e3]`.
pub fn selector_for(element: &str) -> String {
    let id = element.trim().trim_start_matches('[').trim_end_matches(']');
    format!("[data-eid=\"[{id}]\"]")
}

fn parse_snapshot(raw: &str, url: String, title: String) -> Observation {
    let snapshot: RawSnapshot = serde_json::from_str(raw).unwrap_or_default();

    let mut elements = snapshot.elements;
    if elements.len() > MAX_ELEMENTS {
        let total = elements.len();
        elements.truncate(MAX_ELEMENTS);
        elements.push(format!("... [truncated, {total} elements total]"));
    }

    let mut budget = MAX_TEXT_CHARS;
    let mut text = Vec::new();
    for line in snapshot.text {
        let len = line.chars().count();
        if len > budget {
            text.push("... [text truncated]".to_string());
            break;
        }
        budget -= len;
        text.push(line);
    }

    Observation {
        url,
        title,
        elements,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_accepts_bare_and_bracketed_refs() {
        assert_eq!(selector_for("e3"), r#"[data-eid="[e3]"]"#);
        assert_eq!(selector_for("[e12]"), r#"[data-eid="[e12]"]"#);
    }

    #[test]
    fn snapshot_is_parsed_and_bounded() {
        let elements: Vec<String> = (0..MAX_ELEMENTS + 10)
            .map(|i| format!("[e{i}] button \"b{i}\""))
            .collect();
        let raw = serde_json::json!({
            "elements": elements,
            "text": ["Net Worth", "$12,345.67"],
        })
        .to_string();

        let obs = parse_snapshot(&raw, "https://x".into(), "Dash".into());
        assert_eq!(obs.elements.len(), MAX_ELEMENTS + 1);
        assert!(obs.elements.last().unwrap().contains("truncated"));
        assert_eq!(obs.text, vec!["Net Worth", "$12,345.67"]);
    }

    #[test]
    fn garbage_snapshot_yields_empty_observation() {
        let obs = parse_snapshot("not json", "u".into(), "t".into());
        assert!(obs.elements.is_empty());
        assert!(obs.text.is_empty());
        assert_eq!(obs.url, "u");
    }
}
