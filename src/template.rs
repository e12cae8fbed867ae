//! Handlebars rendering for responses marked `template: true`.
//!
//! The template sees the incoming request (`method`, `path`, `url`, `query`,
//! `headers`, `body`, `json`) and the URL regex `captures` from matching.

use crate::matcher::{IncomingRequest, MatchContext};
use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering dynamic responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

#[derive(Debug, Serialize)]
struct RequestView<'a> {
    method: &'a str,
    path: &'a str,
    url: String,
    query: &'a HashMap<String, String>,
    headers: HashMap<String, &'a str>,
    captures: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json: Option<serde_json::Value>,
}

handlebars_helper!(upper: |value: str| value.to_uppercase());
handlebars_helper!(lower: |value: str| value.to_lowercase());

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper));
        handlebars.register_helper("lower", Box::new(lower));

        // Bodies are arbitrary text, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render `template` against the request that matched.
    pub fn render(
        &self,
        template: &str,
        context: &MatchContext,
        incoming: &IncomingRequest,
    ) -> Result<String, handlebars::RenderError> {
        let body = incoming.body.as_deref();
        let ctx = RequestView {
            method: &incoming.method,
            path: &incoming.path,
            url: incoming.url(),
            query: &context.query_params,
            headers: incoming
                .headers
                .iter()
                .map(|(name, value)| (name.to_lowercase(), value.as_str()))
                .collect(),
            captures: &context.captures,
            body,
            json: body.and_then(|b| serde_json::from_str(b).ok()),
        };

        self.handlebars.render_template(template, &ctx)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// `{{now}}` or `{{now "%Y-%m-%d"}}`, in UTC.
fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// `{{random min max}}`, inclusive, defaulting to 0..=100.
fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    let (low, high) = if min <= max { (min, max) } else { (max, min) };

    let value = rand::thread_rng().gen_range(low..=high);
    out.write(&value.to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: the fallback when `value` is missing, null or empty.
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {
            out.write(fallback)?
        }
        Some(other) => out.write(&other.to_string())?,
    }
    Ok(())
}
