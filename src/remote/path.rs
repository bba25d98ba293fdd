use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_input, RunnerError, RunnerResult};

fn parse_segments(path: &str) -> RunnerResult<Vec<String>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid_input("document paths cannot be empty"));
    }
    if trimmed.contains("//") {
        return Err(invalid_input(format!("found empty segment in path {path}")));
    }
    Ok(trimmed.split('/').map(str::to_string).collect())
}

/// Address of a single document: an even number of non-empty segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    pub fn from_string(path: &str) -> RunnerResult<Self> {
        Self::from_segments(parse_segments(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> RunnerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.len() < 2 || segments.len() % 2 != 0 {
            return Err(invalid_input(format!(
                "document paths need an even number of segments, got {}",
                segments.join("/")
            )));
        }
        if segments.iter().any(|segment| segment.is_empty() || segment.contains('/')) {
            return Err(invalid_input("document path segments must be non-empty"));
        }
        Ok(Self { segments })
    }

    pub fn id(&self) -> &str {
        // Construction guarantees at least two segments.
        &self.segments[self.segments.len() - 1]
    }

    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    pub fn collection(&self, id: &str) -> RunnerResult<CollectionPath> {
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        CollectionPath::from_segments(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    /// True when `self` lives directly inside `collection`.
    pub fn is_child_of(&self, collection: &CollectionPath) -> bool {
        self.segments.len() == collection.segments.len() + 1
            && collection
                .segments
                .iter()
                .zip(self.segments.iter())
                .all(|(left, right)| left == right)
    }

    /// True when `self` is `prefix` or nested anywhere below it.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        prefix.len() <= self.segments.len()
            && prefix
                .iter()
                .zip(self.segments.iter())
                .all(|(left, right)| *left == right)
    }
}

impl Display for DocumentPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = RunnerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_string(&value)
    }
}

impl From<DocumentPath> for String {
    fn from(value: DocumentPath) -> Self {
        value.canonical_string()
    }
}

/// Address of a collection: an odd number of non-empty segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    pub fn from_string(path: &str) -> RunnerResult<Self> {
        Self::from_segments(parse_segments(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> RunnerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.len() % 2 != 1 {
            return Err(invalid_input(format!(
                "collection paths need an odd number of segments, got {}",
                segments.join("/")
            )));
        }
        if segments.iter().any(|segment| segment.is_empty() || segment.contains('/')) {
            return Err(invalid_input("collection path segments must be non-empty"));
        }
        Ok(Self { segments })
    }

    pub fn doc(&self, id: &str) -> RunnerResult<DocumentPath> {
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        DocumentPath::from_segments(segments)
    }

    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl Display for CollectionPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}
