//! Record extraction from JSON envelopes and HTML listings, plus the
//! dedup keying shared by the store.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::engine::FetchMode;
use crate::paginate::links::get_by_path;

fn default_items_keys() -> Vec<String> {
    ["items", "results", "data", "posts", "products", "rows", "list"]
        .map(String::from)
        .to_vec()
}

fn default_container_keys() -> Vec<String> {
    ["data", "result", "payload", "response", "meta", "pagination"]
        .map(String::from)
        .to_vec()
}

fn default_max_depth() -> u32 {
    2
}

fn default_id_path() -> Option<String> {
    Some("id".to_string())
}

fn default_id_keys() -> Vec<String> {
    ["id", "uuid", "guid", "product_id", "item_id", "pk", "slug"]
        .map(String::from)
        .to_vec()
}

fn default_mode() -> FetchMode {
    FetchMode::Json
}

/// One HTML field rule: a single expression or a fallback chain.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    One(String),
    Chain(Vec<String>),
}

/// Where the records live in a page, for both JSON and HTML payloads.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExtractSpec {
    pub mode: FetchMode,
    /// Dot-path straight to the item list, tried first.
    pub items_path: Option<String>,
    pub items_keys: Vec<String>,
    /// Envelope keys worth descending into when no list is found.
    pub container_keys: Vec<String>,
    pub max_depth: u32,
    pub id_path: Option<String>,
    pub id_keys: Vec<String>,
    pub html_items_selector: Option<String>,
    /// field name -> "selector", "selector::text" or "selector::attr(name)"
    pub html_fields: BTreeMap<String, FieldRule>,
    /// Item-node attribute promoted to `id` when no field supplies one.
    pub html_id_attr: Option<String>,
}

impl Default for ExtractSpec {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            items_path: None,
            items_keys: default_items_keys(),
            container_keys: default_container_keys(),
            max_depth: default_max_depth(),
            id_path: default_id_path(),
            id_keys: default_id_keys(),
            html_items_selector: None,
            html_fields: BTreeMap::new(),
            html_id_attr: None,
        }
    }
}

fn list_under_keys<'a>(node: &'a Value, keys: &[String]) -> Option<&'a Vec<Value>> {
    let map = node.as_object()?;
    keys.iter()
        .find_map(|k| map.get(k).and_then(Value::as_array))
}

/// Finds the item list: explicit `items_path` first, then a top-level list,
/// then `items_keys` at the root, then a bounded descent through
/// `container_keys`.
pub fn extract_json_items(data: &Value, spec: &ExtractSpec) -> Vec<Value> {
    if let Some(path) = &spec.items_path {
        match get_by_path(data, path) {
            Some(Value::Array(items)) => return items.clone(),
            Some(inner @ Value::Object(_)) => {
                if let Some(items) = list_under_keys(inner, &spec.items_keys) {
                    return items.clone();
                }
            }
            _ => {}
        }
    }

    if let Value::Array(items) = data {
        return items.clone();
    }

    if !data.is_object() {
        return Vec::new();
    }

    if let Some(items) = list_under_keys(data, &spec.items_keys) {
        return items.clone();
    }

    let mut level: Vec<&Value> = vec![data];
    for _ in 0..spec.max_depth {
        let mut next_level: Vec<&Value> = Vec::new();
        for node in &level {
            let Some(map) = node.as_object() else { continue };

            if let Some(items) = list_under_keys(node, &spec.items_keys) {
                return items.clone();
            }
            for ck in &spec.container_keys {
                match map.get(ck) {
                    Some(inner @ Value::Object(_)) => next_level.push(inner),
                    Some(Value::Array(items)) => return items.clone(),
                    _ => {}
                }
            }
        }
        level = next_level;
    }

    Vec::new()
}

fn squash_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    squash_ws(&el.text().collect::<Vec<_>>().join(" "))
}

enum FieldMode {
    Text,
    Attr(String),
}

fn parse_field_expr(expr: &str) -> Option<(Option<Selector>, FieldMode)> {
    let expr = expr.trim();
    if expr.is_empty() {
        return None;
    }
    let (sel_part, mode_part) = match expr.split_once("::") {
        Some((left, right)) => (left.trim(), right.trim()),
        None => (expr, "text"),
    };
    let selector = if sel_part.is_empty() {
        None
    } else {
        Some(Selector::parse(sel_part).ok()?)
    };
    let mode = if mode_part == "text" {
        FieldMode::Text
    } else {
        let name = mode_part
            .strip_prefix("attr(")?
            .strip_suffix(')')?
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if name.is_empty() {
            return None;
        }
        FieldMode::Attr(name.to_ascii_lowercase())
    };
    Some((selector, mode))
}

fn eval_field_expr(item: &ElementRef<'_>, expr: &str) -> Option<String> {
    let (selector, mode) = parse_field_expr(expr)?;
    let target = match &selector {
        Some(sel) => item.select(sel).next()?,
        None => *item,
    };
    let value = match mode {
        FieldMode::Text => element_text(&target),
        FieldMode::Attr(name) => squash_ws(target.value().attr(&name)?),
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn eval_field_rule(item: &ElementRef<'_>, rule: &FieldRule) -> Option<String> {
    match rule {
        FieldRule::One(expr) => eval_field_expr(item, expr),
        FieldRule::Chain(exprs) => exprs.iter().find_map(|e| eval_field_expr(item, e)),
    }
}

/// Turns an HTML listing into flat records per `html_items_selector` and
/// `html_fields`, with conventional `id`/`url`/`title`/`text` fallbacks.
pub fn extract_html_items(html: &str, spec: &ExtractSpec) -> Vec<Value> {
    let Some(selector_text) = spec.html_items_selector.as_deref() else {
        return Vec::new();
    };
    let Ok(item_sel) = Selector::parse(selector_text) else {
        return Vec::new();
    };
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let mut out = Vec::new();

    for item in doc.select(&item_sel) {
        let mut row = serde_json::Map::new();

        for (key, rule) in &spec.html_fields {
            if let Some(value) = eval_field_rule(&item, rule) {
                row.insert(key.clone(), Value::String(value));
            }
        }

        if let Some(attr) = spec.html_id_attr.as_deref() {
            if !row.contains_key("id") {
                if let Some(v) = item.value().attr(&attr.to_ascii_lowercase()) {
                    let v = v.trim();
                    if !v.is_empty() {
                        row.insert("id".to_string(), Value::String(v.to_string()));
                    }
                }
            }
        }

        if let Some(link) = item.select(&link_sel).next() {
            if !row.contains_key("url") {
                if let Some(href) = link.value().attr("href").map(str::trim) {
                    if !href.is_empty() {
                        row.insert("url".to_string(), Value::String(href.to_string()));
                    }
                }
            }
            if !row.contains_key("title") {
                let title = element_text(&link);
                if !title.is_empty() {
                    row.insert("title".to_string(), Value::String(title));
                }
            }
        }

        if !row.contains_key("text") {
            let text = element_text(&item);
            if !text.is_empty() {
                row.insert("text".to_string(), Value::String(text));
            }
        }

        if !row.is_empty() {
            out.push(Value::Object(row));
        }
    }

    out
}

fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Stable item id: `id_path` first, then the `id_keys` fallbacks (dot-paths
/// allowed).
pub fn record_id(item: &Value, spec: &ExtractSpec) -> Option<String> {
    if let Some(path) = &spec.id_path {
        if let Some(id) = get_by_path(item, path).and_then(value_as_id) {
            return Some(id);
        }
    }
    for key in &spec.id_keys {
        let found = if key.contains('.') {
            get_by_path(item, key)
        } else {
            item.as_object().and_then(|m| m.get(key))
        };
        if let Some(id) = found.and_then(value_as_id) {
            return Some(id);
        }
    }
    None
}

/// Dedup key: `id:<id>` when an id exists, otherwise a digest of the whole
/// record. serde_json keeps object keys sorted, so the serialization is
/// canonical.
pub fn item_key(item: &Value, spec: &ExtractSpec) -> String {
    if let Some(id) = record_id(item, spec) {
        return format!("id:{id}");
    }
    let blob = serde_json::to_string(item).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_path_beats_heuristics() {
        let spec = ExtractSpec {
            items_path: Some("payload.rows".to_string()),
            ..Default::default()
        };
        let data = json!({"items": [{"id": 9}], "payload": {"rows": [{"id": 1}, {"id": 2}]}});
        let items = extract_json_items(&data, &spec);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], json!(1));
    }

    #[test]
    fn top_level_list_and_items_keys() {
        let spec = ExtractSpec::default();
        assert_eq!(extract_json_items(&json!([1, 2, 3]), &spec).len(), 3);
        assert_eq!(
            extract_json_items(&json!({"results": [{"id": 1}]}), &spec).len(),
            1
        );
        assert!(extract_json_items(&json!({"count": 0}), &spec).is_empty());
    }

    #[test]
    fn container_descent_is_depth_bounded() {
        let spec = ExtractSpec::default();
        let two_deep = json!({"data": {"response": {"items": [{"id": 1}]}}});
        assert_eq!(extract_json_items(&two_deep, &spec).len(), 1);

        let three_deep = json!({"data": {"response": {"payload": {"items": [{"id": 1}]}}}});
        assert!(extract_json_items(&three_deep, &spec).is_empty());
    }

    #[test]
    fn html_listing_with_field_rules() {
        let spec = ExtractSpec {
            html_items_selector: Some("li.product".to_string()),
            html_fields: BTreeMap::from([
                ("name".to_string(), FieldRule::One(".name::text".to_string())),
                (
                    "price".to_string(),
                    FieldRule::Chain(vec![".sale::text".to_string(), ".price::text".to_string()]),
                ),
                ("img".to_string(), FieldRule::One("img::attr(src)".to_string())),
            ]),
            html_id_attr: Some("data-sku".to_string()),
            ..Default::default()
        };
        let html = r#"
            <ul>
              <li class="product" data-sku="A1">
                <a href="/p/a1"><span class="name">Widget</span></a>
                <span class="price">9.99</span>
                <img src="/img/a1.png">
              </li>
            </ul>"#;
        let items = extract_html_items(html, &spec);
        assert_eq!(items.len(), 1);
        let row = &items[0];
        assert_eq!(row["id"], json!("A1"));
        assert_eq!(row["name"], json!("Widget"));
        assert_eq!(row["price"], json!("9.99"));
        assert_eq!(row["img"], json!("/img/a1.png"));
        assert_eq!(row["url"], json!("/p/a1"));
        assert_eq!(row["title"], json!("Widget"));
    }

    #[test]
    fn html_text_fallback_when_no_fields_match() {
        let spec = ExtractSpec {
            html_items_selector: Some("div.row".to_string()),
            ..Default::default()
        };
        let items = extract_html_items("<div class=\"row\">  hello   world </div>", &spec);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["text"], json!("hello world"));
    }

    #[test]
    fn record_id_priority_and_dot_paths() {
        let spec = ExtractSpec::default();
        assert_eq!(record_id(&json!({"id": 7}), &spec).as_deref(), Some("7"));
        assert_eq!(
            record_id(&json!({"uuid": "u-1"}), &spec).as_deref(),
            Some("u-1")
        );

        let spec = ExtractSpec {
            id_path: Some("attrs.sku".to_string()),
            ..Default::default()
        };
        assert_eq!(
            record_id(&json!({"attrs": {"sku": "S9"}, "id": 1}), &spec).as_deref(),
            Some("S9")
        );
    }

    #[test]
    fn item_key_prefers_ids_and_hashes_otherwise() {
        let spec = ExtractSpec::default();
        assert_eq!(item_key(&json!({"id": 3}), &spec), "id:3");

        let a = item_key(&json!({"b": 2, "a": 1}), &spec);
        let b = item_key(&json!({"a": 1, "b": 2}), &spec);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a, b);
        assert_ne!(a, item_key(&json!({"a": 1, "b": 3}), &spec));
    }
}
