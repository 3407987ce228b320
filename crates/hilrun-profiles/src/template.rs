//! `{name}` placeholder templates used in compiler flags and deploy arguments.
//!
//! `{{` and `}}` are literal braces. Names are ASCII alphanumerics, `_` and `-`.

use std::collections::BTreeMap;

use crate::error::{ProfileError, Result};

/// Placeholders every compiler invocation can reference.
pub const COMPILE_PLACEHOLDERS: &[&str] =
    &["source_dir", "build_dir", "output", "linker_script", "platform"];

/// Placeholders every deploy invocation can reference.
pub const DEPLOY_PLACEHOLDERS: &[&str] =
    &["artifact", "serial_port", "baud", "build_dir", "platform"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn template_error(arg: &str, detail: impl Into<String>) -> ProfileError {
    ProfileError::Template {
        arg: arg.to_string(),
        detail: detail.into(),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn segments(arg: &str) -> Result<Vec<Segment<'_>>> {
    let bytes = arg.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push(Segment::Literal(&arg[literal_start..i]));
                out.push(Segment::Brace('{'));
                i += 2;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push(Segment::Literal(&arg[literal_start..i]));
                out.push(Segment::Brace('}'));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                let rest = &arg[i + 1..];
                let close = rest
                    .find('}')
                    .ok_or_else(|| template_error(arg, "unterminated placeholder"))?;
                let name = &rest[..close];
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(template_error(
                        arg,
                        format!("malformed placeholder '{{{name}}}'"),
                    ));
                }
                out.push(Segment::Literal(&arg[literal_start..i]));
                out.push(Segment::Placeholder(name));
                i += close + 2;
                literal_start = i;
            }
            b'}' => return Err(template_error(arg, "unmatched '}'")),
            _ => i += 1,
        }
    }
    out.push(Segment::Literal(&arg[literal_start..]));
    Ok(out)
}

/// List the placeholder names referenced by a template argument.
pub fn placeholders(arg: &str) -> Result<Vec<&str>> {
    Ok(segments(arg)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name),
            _ => None,
        })
        .collect())
}

/// Values substituted into templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars {
    values: BTreeMap<String, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_string(), value.into());
    }

    /// Add every entry of `other` that is not already set.
    pub fn extend_missing<'a>(
        &mut self,
        other: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) {
        for (k, v) in other {
            self.values.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Expand one template argument.
    pub fn expand(&self, arg: &str) -> Result<String> {
        let mut out = String::with_capacity(arg.len());
        for seg in segments(arg)? {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Brace(c) => out.push(c),
                Segment::Placeholder(name) => match self.values.get(name) {
                    Some(v) => out.push_str(v),
                    None => {
                        return Err(template_error(arg, format!("no value for '{{{name}}}'")))
                    }
                },
            }
        }
        Ok(out)
    }

    /// Expand a whole argument list.
    pub fn expand_all(&self, args: &[String]) -> Result<Vec<String>> {
        args.iter().map(|a| self.expand(a)).collect()
    }
}
