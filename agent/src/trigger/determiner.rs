//! Decide whether a commit touched an application

use regex::Regex;

use crate::errors::AgentError;

/// Glob over slash separated paths: `**` spans directories, `*` and `?`
/// stay inside one segment.
#[derive(Debug, Clone)]
pub struct PathPattern {
    pattern: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, AgentError> {
        let trimmed = pattern.trim_start_matches("./").trim_start_matches('/');
        let mut re = String::from("^");
        let mut chars = trimmed.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                }
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        // A directory pattern covers everything below it.
        re.push_str("(?:/.*)?$");

        let regex = Regex::new(&re)
            .map_err(|e| AgentError::ConfigError(format!("invalid path pattern {}: {}", pattern, e)))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path.trim_start_matches('/'))
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

fn compile(patterns: &[String]) -> Result<Vec<PathPattern>, AgentError> {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| PathPattern::new(p))
        .collect()
}

/// True when a changed file, after dropping ignored ones, lies under
/// `app_dir` or matches one of `paths`.
pub fn is_touched(
    app_dir: &str,
    paths: &[String],
    ignores: &[String],
    changed_files: &[String],
) -> Result<bool, AgentError> {
    let paths = compile(paths)?;
    let ignores = compile(ignores)?;

    let dir = app_dir.trim_matches('/');
    let prefix = if dir.is_empty() || dir == "." {
        String::new()
    } else {
        format!("{}/", dir)
    };

    Ok(changed_files
        .iter()
        .map(|f| f.trim_start_matches('/'))
        .filter(|f| !ignores.iter().any(|p| p.matches(f)))
        .any(|f| f.starts_with(&prefix) || paths.iter().any(|p| p.matches(f))))
}
