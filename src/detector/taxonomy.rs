//! Malicious pattern taxonomy
//!
//! Maps a category name (`php`, `python`, `shell`, `encoded`, ...) to an
//! ordered list of literal trigger strings. All keywords are compiled once
//! into a single [`RegexSet`] of whole-word matchers, so a file is searched
//! in one pass regardless of how many rules are loaded.

use crate::error::ConfigError;
use regex::RegexSet;
use std::collections::BTreeMap;
use std::path::Path;

/// One `(category, keyword)` rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatternRule {
    pub category: String,
    pub keyword: String,
}

/// A named group of trigger strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub keywords: Vec<String>,
}

/// Compiled pattern taxonomy
#[derive(Debug, Clone)]
pub struct Taxonomy {
    categories: Vec<Category>,
    rules: Vec<PatternRule>,
    matcher: RegexSet,
}

impl Taxonomy {
    /// Build a taxonomy from `(category, keywords)` pairs.
    ///
    /// Repeated categories are merged and repeated keywords collapse to their
    /// first occurrence.
    pub fn new<I, K>(categories: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (String, K)>,
        K: IntoIterator<Item = String>,
    {
        let mut merged: Vec<Category> = Vec::new();

        for (name, keywords) in categories {
            let index = match merged.iter().position(|c| c.name == name) {
                Some(i) => i,
                None => {
                    merged.push(Category {
                        name,
                        keywords: Vec::new(),
                    });
                    merged.len() - 1
                }
            };
            let category = &mut merged[index];
            for keyword in keywords {
                if !keyword.is_empty() && !category.keywords.contains(&keyword) {
                    category.keywords.push(keyword);
                }
            }
        }

        let rules: Vec<PatternRule> = merged
            .iter()
            .flat_map(|c| {
                c.keywords.iter().map(move |k| PatternRule {
                    category: c.name.clone(),
                    keyword: k.clone(),
                })
            })
            .collect();

        let matcher = RegexSet::new(rules.iter().map(|r| word_pattern(&r.keyword)))?;

        Ok(Self {
            categories: merged,
            rules,
            matcher,
        })
    }

    /// An empty taxonomy that matches nothing
    pub fn empty() -> Self {
        Self {
            categories: Vec::new(),
            rules: Vec::new(),
            matcher: RegexSet::empty(),
        }
    }

    /// Parse the line format: `category=keyword1 keyword2 ...`
    pub fn parse_lines(text: &str, source: &Path) -> Result<Self, ConfigError> {
        let mut categories = Vec::new();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, keywords) = parse_category_line(line).map_err(|message| ConfigError::Malformed {
                path: source.to_path_buf(),
                line: number + 1,
                message,
            })?;
            categories.push((name, keywords));
        }

        Self::new(categories).map_err(|e| ConfigError::Malformed {
            path: source.to_path_buf(),
            line: 0,
            message: e.to_string(),
        })
    }

    /// Parse the structured form: a YAML or JSON mapping of category to list
    pub fn parse_structured(text: &str, source: &Path) -> Result<Self, ConfigError> {
        let map: BTreeMap<String, Vec<String>> = if text.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(text)?
        };

        Self::new(map).map_err(|e| ConfigError::Malformed {
            path: source.to_path_buf(),
            line: 0,
            message: e.to_string(),
        })
    }

    /// Parse using the format implied by the file extension
    pub fn parse(text: &str, source: &Path) -> Result<Self, ConfigError> {
        if is_structured(source) {
            Self::parse_structured(text, source)
        } else {
            Self::parse_lines(text, source)
        }
    }

    /// Render in the format implied by the file extension
    pub fn render(&self, target: &Path) -> Result<String, ConfigError> {
        if !is_structured(target) {
            let mut out = String::new();
            for line in self.to_lines() {
                out.push_str(&line);
                out.push('\n');
            }
            return Ok(out);
        }

        let map: BTreeMap<&str, &Vec<String>> = self
            .categories
            .iter()
            .map(|c| (c.name.as_str(), &c.keywords))
            .collect();

        let is_json = target.extension().and_then(|e| e.to_str()) == Some("json");
        if is_json {
            serde_json::to_string_pretty(&map).map_err(|e| ConfigError::Malformed {
                path: target.to_path_buf(),
                line: 0,
                message: e.to_string(),
            })
        } else {
            Ok(serde_yaml::to_string(&map)?)
        }
    }

    /// One `category=...` line per category
    pub fn to_lines(&self) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("{}={}", c.name, c.keywords.join(" ")))
            .collect()
    }

    /// Copy of this taxonomy with one category replaced (or appended)
    pub fn with_category(&self, name: &str, keywords: Vec<String>) -> Result<Self, regex::Error> {
        let mut categories: Vec<(String, Vec<String>)> = Vec::new();
        let mut replaced = false;

        for c in &self.categories {
            if c.name == name {
                categories.push((name.to_string(), keywords.clone()));
                replaced = true;
            } else {
                categories.push((c.name.clone(), c.keywords.clone()));
            }
        }
        if !replaced {
            categories.push((name.to_string(), keywords));
        }

        Self::new(categories)
    }

    /// Copy of this taxonomy without `name`, or `None` if it has no such category
    pub fn without_category(&self, name: &str) -> Option<Self> {
        if !self.categories.iter().any(|c| c.name == name) {
            return None;
        }

        let categories = self
            .categories
            .iter()
            .filter(|c| c.name != name)
            .map(|c| (c.name.clone(), c.keywords.clone()));

        // Every remaining keyword already compiled once
        Self::new(categories).ok()
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules whose keyword occurs as a whole word in `content`.
    ///
    /// Comparison is case-sensitive. Each rule is reported at most once.
    pub fn matches<'a>(&'a self, content: &str) -> impl Iterator<Item = &'a PatternRule> + 'a {
        let hits = self.matcher.matches(content);
        hits.into_iter().map(move |i| &self.rules[i])
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Taxonomy {
    fn eq(&self, other: &Self) -> bool {
        self.categories == other.categories
    }
}

fn is_structured(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Split a `category=kw1 kw2` line
pub(crate) fn parse_category_line(line: &str) -> Result<(String, Vec<String>), String> {
    let (name, keywords) = line
        .split_once('=')
        .ok_or_else(|| format!("expected `category=keywords`, got {:?}", line))?;

    let name = name.trim();
    if name.is_empty() {
        return Err("empty category name".to_string());
    }

    let keywords = keywords.split_whitespace().map(str::to_string).collect();
    Ok((name.to_string(), keywords))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Word boundaries are only required on sides where the keyword itself
/// begins or ends with a word character; `\b` next to punctuation such as
/// `$(` would otherwise demand a neighbouring identifier.
fn word_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 4);
    if keyword.chars().next().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(keyword));
    if keyword.chars().last().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern
}
