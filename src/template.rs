//! Template Resolver.
//!
//! Renders `{{path}}` tokens against a JSON scope. Supported forms:
//!
//! ```text
//! {{name}}                     plain variable
//! {{global.titulo}}            namespaced variable
//! {{productos[0].nombre}}      dotted / indexed path
//! {{name || "literal"}}        fallback when the variable is missing or empty
//! {{#each list}}..{{/each}}    repeat block, element fields resolve unqualified,
//!                              other names fall back to the outer scope
//! ```
//!
//! Rendering is total: missing variables render as their fallback or as an empty
//! string, malformed templates degrade to a token-by-token substitution, and the
//! output never contains a literal `{{`.

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::trace;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").unwrap());
static INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").unwrap());
static SINGLE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\{\{([^{}#/]+?)\}\}\s*$").unwrap());

static RESOLVER: Lazy<TemplateResolver> = Lazy::new(TemplateResolver::new);

/// Shared resolver instance.
pub fn resolver() -> &'static TemplateResolver {
    &RESOLVER
}

/// Convenience for `resolver().render(..)`.
pub fn render(template: &str, scope: &Value) -> String {
    RESOLVER.render(template, scope)
}

pub struct TemplateResolver {
    hb: Handlebars<'static>,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        hb.set_strict_mode(false);
        hb.register_helper(
            "default",
            Box::new(
                |h: &Helper<'_>,
                 _: &Handlebars<'_>,
                 _: &Context,
                 _: &mut RenderContext<'_, '_>,
                 out: &mut dyn Output|
                 -> HelperResult {
                    let primary = h.param(0).map(|p| p.value().clone()).unwrap_or(Value::Null);
                    let chosen = if is_present(&primary) {
                        primary
                    } else {
                        h.param(1).map(|p| p.value().clone()).unwrap_or(Value::Null)
                    };
                    out.write(&value_to_string(&chosen))?;
                    Ok(())
                },
            ) as Box<dyn HelperDef + Send + Sync>,
        );
        Self { hb }
    }

    /// Render `template` against `scope`. Never fails.
    pub fn render(&self, template: &str, scope: &Value) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let prepared = prepare(template, scope);
        let rendered = match self.hb.render_template(&prepared, scope) {
            Ok(out) => out,
            Err(err) => {
                trace!("template fell back to token substitution: {}", err);
                substitute(template, scope)
            }
        };
        sanitize(rendered)
    }

    /// Render every string inside a JSON value. A string made of exactly one
    /// token is replaced by the raw value it points at, so numbers and arrays
    /// keep their type inside request bodies.
    pub fn render_value(&self, value: &Value, scope: &Value) -> Value {
        match value {
            Value::String(s) => match SINGLE_TOKEN.captures(s) {
                Some(caps) => resolve_expr(&caps[1], scope).unwrap_or(Value::Null),
                None => Value::String(self.render(s, scope)),
            },
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.render_value(v, scope)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Rewrite our token dialect into plain handlebars. Inside `#each` blocks a
/// name the list elements do not carry is pointed at the outer scope with `../`.
fn prepare(template: &str, scope: &Value) -> String {
    let mut blocks: Vec<Option<Value>> = Vec::new();
    TOKEN
        .replace_all(template, |caps: &Captures| {
            let inner = caps[1].trim();
            if inner.starts_with('#') || inner.starts_with('/') || inner.starts_with('!') || inner == "else" {
                if let Some(list) = inner.strip_prefix("#each") {
                    blocks.push(Some(resolve_expr(list, scope).unwrap_or(Value::Null)));
                } else if inner.starts_with('#') {
                    blocks.push(None);
                } else if inner.starts_with('/') {
                    blocks.pop();
                }
                return format!("{{{{{}}}}}", INDEX.replace_all(inner, ".[$1]"));
            }
            match split_fallback(inner) {
                Some((lhs, rhs)) => format!(
                    "{{{{default {} {}}}}}",
                    scoped_path(lhs, &blocks, scope),
                    hb_fallback(rhs, &blocks, scope)
                ),
                None => format!("{{{{{}}}}}", scoped_path(inner, &blocks, scope)),
            }
        })
        .into_owned()
}

fn scoped_path(path: &str, blocks: &[Option<Value>], scope: &Value) -> String {
    let plain = hb_path(path);
    let depth = blocks.iter().flatten().count();
    let path = path.trim();
    if depth == 0 || path == "this" || path.starts_with("this.") || path.starts_with('@') || path.starts_with('.') {
        return plain;
    }
    let Some(Segment::Key(head)) = segments(path).into_iter().next() else {
        return plain;
    };
    let on_element = match blocks.iter().rev().flatten().next() {
        Some(Value::Array(items)) => items.iter().any(|item| item.get(&head).is_some()),
        Some(Value::Object(map)) => map.values().any(|item| item.get(&head).is_some()),
        _ => false,
    };
    if on_element || lookup(scope, path).is_none() {
        plain
    } else {
        format!("{}{}", "../".repeat(depth), plain)
    }
}

fn hb_path(path: &str) -> String {
    INDEX.replace_all(path.trim(), ".[$1]").into_owned()
}

fn hb_fallback(rhs: &str, blocks: &[Option<Value>], scope: &Value) -> String {
    let rhs = rhs.trim();
    if let Some(inner) = rhs.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
        format!("\"{}\"", inner.replace('"', "\\\""))
    } else if rhs.starts_with('"') {
        rhs.to_string()
    } else {
        scoped_path(rhs, blocks, scope)
    }
}

fn split_fallback(inner: &str) -> Option<(&str, &str)> {
    inner.split_once("||").map(|(l, r)| (l.trim(), r.trim()))
}

/// Token-by-token substitution used when handlebars rejects a template.
/// Block tokens are dropped.
fn substitute(template: &str, scope: &Value) -> String {
    TOKEN
        .replace_all(template, |caps: &Captures| {
            let inner = caps[1].trim();
            if inner.starts_with('#') || inner.starts_with('/') || inner.starts_with('!') {
                return String::new();
            }
            resolve_expr(inner, scope)
                .map(|v| value_to_string(&v))
                .unwrap_or_default()
        })
        .into_owned()
}

fn sanitize(mut out: String) -> String {
    if out.contains("{{") {
        out = TOKEN.replace_all(&out, "").into_owned();
        while out.contains("{{") {
            out = out.replace("{{", "{");
        }
    }
    out
}

/// Resolve a token body (`path` or `path || fallback`) to a value.
pub fn resolve_expr(expr: &str, scope: &Value) -> Option<Value> {
    let expr = expr.trim();
    match split_fallback(expr) {
        Some((lhs, rhs)) => {
            if let Some(v) = lookup(scope, lhs).filter(|v| is_present(v)) {
                return Some(v.clone());
            }
            if let Some(lit) = unquote(rhs) {
                Some(Value::String(lit.to_string()))
            } else {
                lookup(scope, rhs).cloned()
            }
        }
        None => lookup(scope, expr).cloned(),
    }
}

/// Strip matching single or double quotes.
pub fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn segments(path: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut key = String::new();
    let mut chars = path.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !key.is_empty() {
                    out.push(Segment::Key(std::mem::take(&mut key)));
                }
            }
            '[' => {
                if !key.is_empty() {
                    out.push(Segment::Key(std::mem::take(&mut key)));
                }
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                match inner.trim().parse::<usize>() {
                    Ok(i) => out.push(Segment::Index(i)),
                    Err(_) => {
                        let k = unquote(&inner).unwrap_or(inner.trim()).to_string();
                        out.push(Segment::Key(k));
                    }
                }
            }
            _ => key.push(c),
        }
    }
    if !key.is_empty() {
        out.push(Segment::Key(key));
    }
    out
}

/// Walk a dotted / indexed path (`a.b[0].c`, `a.0.c`) through a JSON value.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let segs = segments(path);
    if segs.is_empty() {
        return None;
    }
    let mut current = scope;
    for seg in segs {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(&k)?,
            (Segment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (Segment::Index(i), Value::Array(items)) => items.get(i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// True when a value counts as set: not null and not an empty string.
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "nombre": "Ana",
            "global": { "titulo": "Dune" },
            "productos": [
                { "nombre": "Libro", "precio": 10 },
                { "nombre": "Revista", "precio": 4 }
            ],
            "vacio": ""
        })
    }

    #[test]
    fn renders_plain_and_namespaced() {
        let out = render("Hola {{nombre}}, buscas {{global.titulo}}?", &scope());
        assert_eq!(out, "Hola Ana, buscas Dune?");
    }

    #[test]
    fn renders_indexed_paths() {
        let out = render("{{productos[1].nombre}} cuesta {{productos[1].precio}}", &scope());
        assert_eq!(out, "Revista cuesta 4");
    }

    #[test]
    fn missing_variables_render_empty() {
        let out = render("[{{nope}}] [{{global.nope}}] [{{productos[9].nombre}}]", &scope());
        assert_eq!(out, "[] [] []");
    }

    #[test]
    fn fallback_literal_used_when_missing_or_empty() {
        let s = scope();
        assert_eq!(render(r#"{{nope || "sin dato"}}"#, &s), "sin dato");
        assert_eq!(render("{{vacio || 'n/a'}}", &s), "n/a");
        assert_eq!(render(r#"{{nombre || "x"}}"#, &s), "Ana");
    }

    #[test]
    fn each_block_renders_element_fields() {
        let out = render("{{#each productos}}[{{nombre}}:{{precio}}]{{/each}}", &scope());
        assert_eq!(out, "[Libro:10][Revista:4]");
    }

    #[test]
    fn each_block_sees_outer_names() {
        let s = json!({
            "tienda": "Libros Ana",
            "global": { "ciudad": "Lima" },
            "lista": [{ "titulo": "Dune" }, { "titulo": "Emma" }]
        });
        let out = render(
            "{{#each lista}}{{titulo}} en {{tienda}} ({{global.ciudad}}, {{nota || 'sin nota'}}); {{/each}}",
            &s,
        );
        assert_eq!(
            out,
            "Dune en Libros Ana (Lima, sin nota); Emma en Libros Ana (Lima, sin nota); "
        );

        let out = render("{{#each lista}}{{titulo}}@{{ciudad || global.ciudad}} {{/each}}", &s);
        assert_eq!(out, "Dune@Lima Emma@Lima ");
    }

    #[test]
    fn no_html_escaping() {
        let out = render("{{v}}", &json!({"v": "<b>&</b>"}));
        assert_eq!(out, "<b>&</b>");
    }

    #[test]
    fn malformed_templates_never_leave_braces() {
        let s = scope();
        for t in ["{{#each productos}} unclosed", "hola {{", "{{nombre}} {{ bad token ||}}", "{{{{x}}"] {
            let out = render(t, &s);
            assert!(!out.contains("{{"), "`{}` rendered to `{}`", t, out);
        }
    }

    #[test]
    fn render_value_keeps_types_for_single_tokens() {
        let body = json!({"precio": "{{productos[0].precio}}", "texto": "Hola {{nombre}}", "falta": "{{nope}}"});
        let out = resolver().render_value(&body, &scope());
        assert_eq!(out, json!({"precio": 10, "texto": "Hola Ana", "falta": null}));
    }

    #[test]
    fn lookup_handles_mixed_paths() {
        let s = scope();
        assert_eq!(lookup(&s, "productos.0.nombre"), Some(&json!("Libro")));
        assert_eq!(lookup(&s, "productos[1]['nombre']"), Some(&json!("Revista")));
        assert_eq!(lookup(&s, "nombre.x"), None);
        assert_eq!(lookup(&s, ""), None);
    }

    #[test]
    fn resolve_expr_with_fallback() {
        let s = scope();
        assert_eq!(resolve_expr("nope || 'x'", &s), Some(json!("x")));
        assert_eq!(resolve_expr("nope || nombre", &s), Some(json!("Ana")));
        assert_eq!(resolve_expr("nope", &s), None);
    }
}
