use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::SpaceError;

/// `owner/name` identity of a hosted space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpaceReference {
    owner: String,
    name: String,
}

impl SpaceReference {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, SpaceError> {
        let owner = owner.into();
        let name = name.into();
        if !valid_segment(&owner) || !valid_segment(&name) {
            return Err(SpaceError::InvalidReference(format!("{owner}/{name}")));
        }
        Ok(Self { owner, name })
    }

    pub fn parse(raw: &str) -> Result<Self, SpaceError> {
        let trimmed = raw.trim().trim_matches('/');
        let (owner, name) = trimmed
            .split_once('/')
            .ok_or_else(|| SpaceError::InvalidReference(raw.to_string()))?;
        Self::new(owner, name).map_err(|_| SpaceError::InvalidReference(raw.to_string()))
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains('/')
        && !segment.chars().any(char::is_whitespace)
}

impl fmt::Display for SpaceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for SpaceReference {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// What a caller asks to connect to: a hub reference, or a space URL that
/// bypasses host lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceTarget {
    Reference(SpaceReference),
    Direct(Url),
}

impl SpaceTarget {
    pub fn parse(raw: &str) -> Result<Self, SpaceError> {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed)
                .map_err(|err| SpaceError::InvalidReference(format!("{trimmed}: {err}")))?;
            return Ok(SpaceTarget::Direct(url));
        }
        SpaceReference::parse(trimmed).map(SpaceTarget::Reference)
    }

    pub fn reference(&self) -> Option<&SpaceReference> {
        match self {
            SpaceTarget::Reference(reference) => Some(reference),
            SpaceTarget::Direct(_) => None,
        }
    }
}

impl From<SpaceReference> for SpaceTarget {
    fn from(value: SpaceReference) -> Self {
        SpaceTarget::Reference(value)
    }
}

impl fmt::Display for SpaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceTarget::Reference(reference) => reference.fmt(f),
            SpaceTarget::Direct(url) => url.fmt(f),
        }
    }
}

/// Caller-supplied bearer token. Only emptiness is checked locally; the
/// server decides whether the token is any good.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self, SpaceError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(SpaceError::InvalidConfig("credential token cannot be empty".into()));
        }
        Ok(Self { token })
    }

    /// Blank or missing tokens mean anonymous access.
    pub fn from_optional(token: Option<&str>) -> Option<Self> {
        token.and_then(|token| Self::new(token).ok())
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential").field("token", &"<redacted>").finish()
    }
}
