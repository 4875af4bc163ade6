//! Build environment — `$VARIABLE` templating over a set of raw values.
//!
//! Values may reference each other; evaluation is recursive and fails on
//! reference cycles instead of looping.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("evaluation loop: {}", .chain.join(" => "))]
    Cycle { chain: Vec<String> },
}

fn token_pattern() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$(\w+)").expect("static pattern"))
}

/// Raw variable name → template string mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Substitute every `$NAME` token in `input`. Unknown names expand to "".
    pub fn evaluate(&self, input: &str) -> Result<String, EvaluationError> {
        self.evaluate_on_path(input, &mut Vec::new())
    }

    /// Evaluated copy of every variable.
    pub fn evaluate_all(&self) -> Result<BTreeMap<String, String>, EvaluationError> {
        self.vars
            .iter()
            .map(|(name, raw)| Ok((name.clone(), self.evaluate(raw)?)))
            .collect()
    }

    fn evaluate_on_path(
        &self,
        input: &str,
        path: &mut Vec<String>,
    ) -> Result<String, EvaluationError> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;

        for caps in token_pattern().captures_iter(input) {
            let (Some(token), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&input[last..token.start()]);
            last = token.end();

            let name = name.as_str();
            if path.iter().any(|seen| seen == name) {
                let mut chain = path.clone();
                chain.push(name.to_string());
                return Err(EvaluationError::Cycle { chain });
            }

            if let Some(raw) = self.vars.get(name) {
                path.push(name.to_string());
                out.push_str(&self.evaluate_on_path(raw, path)?);
                path.pop();
            }
        }

        out.push_str(&input[last..]);
        Ok(out)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Environment {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}
