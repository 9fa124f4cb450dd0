//! Strict `${name}` template rendering.

use std::collections::BTreeMap;

/// Error raised while rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A placeholder names a variable that has no value.
    #[error("'{0}' is undefined")]
    Undefined(String),
    /// A `${` sequence is never closed.
    #[error("unclosed placeholder: ${{{0}")]
    Unclosed(String),
}

/// Render `template`, replacing every `${name}` with `vars[name]`.
///
/// Rendering is strict: an unknown name is an error, never an empty string.
/// A literal `${` is written as `$${`; any other `$` is left as is, so shell
/// forms such as `$1` or `$HOME` pass through untouched.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
///
/// let vars = BTreeMap::from([("nproc".to_string(), "100".to_string())]);
/// assert_eq!(exetest::template::render("echo ${nproc}", &vars).unwrap(), "echo 100");
/// assert!(exetest::template::render("echo ${other}", &vars).is_err());
/// ```
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    expand(template, |name| {
        vars.get(name)
            .cloned()
            .ok_or_else(|| TemplateError::Undefined(name.to_string()))
    })
}

/// Names of all placeholders in `template`, in order of first appearance.
///
/// Placeholders are recognized exactly as [`render`] does; scanning stops at
/// an unclosed one.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let _ = expand(template, |name| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        Ok(String::new())
    });
    names
}

/// Scan `template`, replacing every placeholder with the value `lookup` gives for its name.
fn expand<F>(template: &str, mut lookup: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<String, TemplateError>,
{
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next(); // consume second '$'
                if chars.peek() == Some(&'{') {
                    chars.next();
                    result.push_str("${");
                } else {
                    result.push_str("$$");
                }
            }
            Some('{') => {
                chars.next(); // consume '{'
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(TemplateError::Unclosed(name)),
                    }
                }
                result.push_str(&lookup(name.trim())?);
            }
            _ => result.push(c),
        }
    }

    Ok(result)
}
