//! `${name}` placeholder replacement for script text.
//!
//! Replacement is a single left-to-right pass: values are inserted verbatim and
//! never rescanned, so a value containing `${other}` stays as written.
//! Placeholders without a value are left untouched.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex_lite::{Captures, Regex};

/// Variables available to substitution and script generators.
pub type Variables = HashMap<String, String>;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("placeholder pattern is valid")
});

/// Replace every `${name}` whose name is defined in `variables`.
pub fn substitute<'a>(text: &'a str, variables: &Variables) -> Cow<'a, str> {
    if variables.is_empty() {
        return Cow::Borrowed(text);
    }

    PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| match variables.get(&caps[1]) {
        Some(value) => value.clone(),
        None => caps[0].to_string(),
    })
}

/// Names referenced in `text` that have no value in `variables`.
///
/// Each name is reported once, in order of first appearance.
pub fn unresolved_variables(text: &str, variables: &Variables) -> Vec<String> {
    let mut seen = HashSet::new();
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| {
            let name = &caps[1];
            if variables.contains_key(name) || !seen.insert(name.to_string()) {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}
