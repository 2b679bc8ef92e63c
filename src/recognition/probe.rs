use serde_json::{json, Value};

/// Pipeline entry every probe is issued under.
pub const PROBE_ENTRY: &str = "OCR";

/// Host action attached to every probe, so a probe never touches the screen.
pub const NO_ACTION: &str = "DoNothing";

/// One inspection-only recognition query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe<'a> {
    /// OCR looking for exactly this text.
    Text(&'a str),
    /// Template match against an image in the host resource dir.
    Template(&'a str),
}

impl<'a> Probe<'a> {
    pub fn target(&self) -> &'a str {
        match self {
            Probe::Text(label) => label,
            Probe::Template(template) => template,
        }
    }

    pub fn pipeline_override(&self) -> Value {
        let node = match self {
            Probe::Text(label) => json!({
                "recognition": "OCR",
                "expected": label,
                "action": NO_ACTION,
            }),
            Probe::Template(template) => json!({
                "recognition": "TemplateMatch",
                "template": [template],
                "action": NO_ACTION,
            }),
        };
        let mut root = serde_json::Map::new();
        root.insert(PROBE_ENTRY.to_string(), node);
        Value::Object(root)
    }
}
