use lru::LruCache;
use parking_lot::Mutex;

/// Default bound on the label cache. A practical per-process ceiling, not a
/// correctness bound; the set of distinct label-sets per tenant is typically
/// small and stable within a deployment window.
pub const DEFAULT_LABEL_CACHE_SIZE: usize = 100_000;

pub type Labels = Vec<(String, String)>;

/// Parse a raw label-set string of the form `{name="value", ...}` into
/// (name, value) pairs sorted by name. Duplicate names are preserved here
/// and rejected later by label validation, so the caller sees a precise
/// error instead of a silent merge.
pub fn parse_labels(raw: &str) -> Result<Labels, String> {
    let mut chars = raw.trim().chars().peekable();

    match chars.next() {
        Some('{') => {}
        Some(c) => return Err(format!("expected '{{' at start of label set, found '{c}'")),
        None => return Err("empty label set".to_string()),
    }

    let mut labels: Labels = Vec::new();
    loop {
        skip_spaces(&mut chars);
        match chars.peek() {
            Some('}') => {
                chars.next();
                break;
            }
            None => return Err("unexpected end of label set, expected '}'".to_string()),
            _ => {}
        }

        let name = parse_name(&mut chars)?;
        skip_spaces(&mut chars);
        if chars.next() != Some('=') {
            return Err(format!("expected '=' after label name '{name}'"));
        }
        skip_spaces(&mut chars);
        let value = parse_quoted_value(&mut chars, &name)?;
        labels.push((name, value));

        skip_spaces(&mut chars);
        match chars.peek() {
            Some(',') => {
                chars.next();
            }
            Some('}') => {}
            Some(c) => return Err(format!("expected ',' or '}}', found '{c}'")),
            None => return Err("unexpected end of label set, expected '}'".to_string()),
        }
    }

    skip_spaces(&mut chars);
    if let Some(c) = chars.next() {
        return Err(format!("unexpected trailing character '{c}' after label set"));
    }

    labels.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(labels)
}

/// The canonical string form of a sorted label set: `{a="1", b="2"}`.
/// Identical inputs in any order produce identical output, which is what the
/// routing hash and downstream dedup key on.
pub fn canonical_string(labels: &[(String, String)]) -> String {
    let mut out = String::with_capacity(16 * labels.len().max(1));
    out.push('{');
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push('=');
        write_quoted(&mut out, value);
    }
    out.push('}');
    out
}

fn skip_spaces(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while matches!(chars.peek(), Some(c) if c.is_ascii_whitespace()) {
        chars.next();
    }
}

fn parse_name(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, String> {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if name.is_empty() {
        return Err("expected label name".to_string());
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("label name '{name}' must not start with a digit"));
    }
    Ok(name)
}

fn parse_quoted_value(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    name: &str,
) -> Result<String, String> {
    if chars.next() != Some('"') {
        return Err(format!("expected quoted value for label '{name}'"));
    }
    let mut value = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(value),
            Some('\\') => match chars.next() {
                Some('"') => value.push('"'),
                Some('\\') => value.push('\\'),
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(c) => return Err(format!("invalid escape '\\{c}' in label '{name}'")),
                None => return Err(format!("unterminated value for label '{name}'")),
            },
            Some(c) => value.push(c),
            None => return Err(format!("unterminated value for label '{name}'")),
        }
    }
}

fn write_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

/// Bounded cache of raw label string -> canonical form. Hits bypass parsing
/// and validation entirely; entries are inserted only after a successful
/// parse + validate, so a hit can never resurface a label set that current
/// rules would reject. Eviction is by capacity only.
pub struct LabelCache {
    inner: Mutex<LruCache<String, String>>,
}

impl LabelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    pub fn get(&self, raw: &str) -> Option<String> {
        self.inner.lock().get(raw).cloned()
    }

    pub fn insert(&self, raw: String, canonical: String) {
        self.inner.lock().put(raw, canonical);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
