//! Scope tokens, scope sets and the scope whitelist

use std::{collections::BTreeSet, fmt, iter::FromIterator};

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Status;

/// An invalid scope token
#[derive(Debug, Error)]
pub enum InvalidScopeToken {
    /// The scope token was the empty string
    #[error("scope token cannot be empty")]
    EmptyString,
    /// The scope token contained an invalid byte
    #[error("invalid scope token byte at position {position}: 0x{value:02x}")]
    InvalidByte {
        /// The index in the scope token where the invalid byte was found
        position: usize,
        /// The invalid byte value
        value: u8,
    },
}

impl From<std::convert::Infallible> for InvalidScopeToken {
    #[inline(always)]
    fn from(x: std::convert::Infallible) -> Self {
        match x {}
    }
}

/// A single API permission, usually a URL such as
/// `https://www.googleapis.com/auth/devstorage.read_write`
///
/// A scope token must be composed of printable ASCII characters excluding
/// ` ` (space), `"` (double quote), `\` (backslash) and `,` (comma).
#[braid(serde, validator, ref_doc = "A borrowed reference to a [`ScopeToken`]")]
pub struct ScopeToken;

impl aliri_braid::Validator for ScopeToken {
    type Error = InvalidScopeToken;

    fn validate(s: &str) -> Result<(), Self::Error> {
        if s.is_empty() {
            Err(InvalidScopeToken::EmptyString)
        } else if let Some((position, &value)) = s
            .as_bytes()
            .iter()
            .enumerate()
            .find(|(_, &b)| b <= 0x20 || b == 0x22 || b == 0x2C || b == 0x5C || 0x7F <= b)
        {
            Err(InvalidScopeToken::InvalidByte { position, value })
        } else {
            Ok(())
        }
    }
}

/// An ordered set of scope tokens
///
/// Two scope sets are equal when they contain the same tokens, regardless of
/// the order in which they were requested.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scopes(BTreeSet<ScopeToken>);

impl Scopes {
    /// Produces an empty scope set
    #[inline]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses a list of raw scope strings
    ///
    /// Duplicates are collapsed.
    ///
    /// # Errors
    ///
    /// Fails if any scope is not a valid scope token.
    pub fn parse<I, S>(raw: I) -> Result<Self, InvalidScopeToken>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .map(|s| ScopeToken::new(s.as_ref().to_owned()))
            .collect()
    }

    /// Adds a scope token to the set
    #[inline]
    pub fn insert(&mut self, scope_token: ScopeToken) {
        self.0.insert(scope_token);
    }

    /// Whether the set holds no scope tokens
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of scope tokens in the set
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set contains the given token
    #[inline]
    pub fn contains(&self, token: &ScopeTokenRef) -> bool {
        self.0.contains(token)
    }

    /// Iterates the scope tokens in order
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ScopeTokenRef> {
        self.0.iter().map(|t| &**t)
    }
}

impl FromIterator<ScopeToken> for Scopes {
    fn from_iter<T: IntoIterator<Item = ScopeToken>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Scopes {
    type Item = &'a ScopeToken;
    type IntoIter = std::collections::btree_set::Iter<'a, ScopeToken>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for token in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(token.as_str())?;
            first = false;
        }
        Ok(())
    }
}

/// The set of scopes the broker is willing to issue tokens for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeWhitelist(Scopes);

impl ScopeWhitelist {
    /// Constructs a whitelist from the permitted scopes
    pub fn new(allowed: Scopes) -> Self {
        Self(allowed)
    }

    /// The permitted scopes
    pub fn allowed(&self) -> &Scopes {
        &self.0
    }

    /// Parses and checks requested scopes
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if no scope was requested, if a scope is
    /// malformed, or if a scope is outside the whitelist.
    pub fn check<I, S>(&self, requested: I) -> Result<Scopes, Status>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let scopes = Scopes::parse(requested)
            .map_err(|err| Status::invalid_argument(format!("Invalid scope: {err}")))?;

        if scopes.is_empty() {
            return Err(Status::invalid_argument(
                "Request must provide at least one scope",
            ));
        }

        if let Some(denied) = scopes.iter().find(|s| !self.0.contains(s)) {
            return Err(Status::invalid_argument(format!(
                "`{denied}` is not a whitelisted scope"
            )));
        }

        Ok(scopes)
    }
}
