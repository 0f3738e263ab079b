//! Push-path construction and HELP line rewriting.

use std::collections::{BTreeMap, HashSet};

use base64ct::{Base64Url, Encoding};

use crate::model::HelpOverrides;

static HELP_PREFIX: &str = "# HELP ";

/// Builds the gateway grouping-key path for a push:
/// `{gateway}/metrics/job/{job}/instance/{instance}/{label}/{value}...`.
///
/// Labels come out in key order since they live in a `BTreeMap`.
pub fn push_path(
    gateway: &str,
    job: &str,
    instance: &str,
    labels: &BTreeMap<String, String>,
) -> String {
    let mut path = format!(
        "{}/metrics/{}/{}",
        gateway.trim_end_matches('/'),
        segment("job", job),
        segment("instance", instance)
    );
    for (name, value) in labels {
        path.push('/');
        path.push_str(&segment(name, value));
    }
    path
}

// Anything other than a plain path token uses the gateway's
// `name@base64/value` form.
fn segment(name: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{}@base64/=", name)
    } else if value.chars().all(is_path_safe) {
        format!("{}/{}", name, value)
    } else {
        format!("{}@base64/{}", name, Base64Url::encode_string(value.as_bytes()))
    }
}

fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | ':')
}

/// Replaces `# HELP {name} ...\n` with `# HELP {name} {override}\n` for every
/// name present in `overrides`. Only the first HELP line per name is touched,
/// and only when it is newline-terminated; its terminator (`\n` or `\r\n`)
/// is kept. Every other byte is kept as is.
pub fn rewrite_help(body: &str, overrides: &HelpOverrides) -> String {
    if overrides.is_empty() {
        return body.to_string();
    }

    let mut out = String::with_capacity(body.len());
    let mut replaced: HashSet<&str> = HashSet::new();

    for line in body.split_inclusive('\n') {
        match help_override(line, overrides) {
            Some((name, help, terminator)) if !replaced.contains(name) => {
                replaced.insert(name);
                out.push_str(HELP_PREFIX);
                out.push_str(name);
                out.push(' ');
                out.push_str(help);
                out.push_str(terminator);
            }
            _ => out.push_str(line),
        }
    }

    out
}

fn help_override<'a, 'o>(
    line: &'a str,
    overrides: &'o HelpOverrides,
) -> Option<(&'a str, &'o str, &'static str)> {
    let content = line.strip_suffix('\n')?;
    let (content, terminator) = match content.strip_suffix('\r') {
        Some(content) => (content, "\r\n"),
        None => (content, "\n"),
    };
    let rest = content.strip_prefix(HELP_PREFIX)?;
    let name = rest.split(|c: char| c == ' ' || c == '\t').next()?;
    if name.is_empty() {
        return None;
    }
    overrides.get(name).map(|help| (name, help.as_str(), terminator))
}
