//! Principal parsing and identity mapping
//!
//! Callers authenticate as Kerberos-style principals such as
//! `alice@EXAMPLE.COM` or `yarn/host.example.com@FOO.BAR`, while the
//! credential minting service knows them by a normalized identity such as
//! `alice@example.com`. A [`UserMapper`] bridges the two using an ordered list
//! of rules, each a predicate over the principal's parts and a template
//! rendering the identity.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Identity, Status};

/// A principal that could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid principal `{principal}`: {reason}")]
pub struct InvalidPrincipal {
    principal: String,
    reason: &'static str,
}

fn invalid_principal(principal: &str, reason: &'static str) -> InvalidPrincipal {
    InvalidPrincipal {
        principal: principal.to_owned(),
        reason,
    }
}

/// A parsed principal of the form `primary[/instance][@realm]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    raw: String,
    primary: String,
    instance: Option<String>,
    realm: Option<String>,
}

impl Principal {
    /// Parses a principal
    ///
    /// # Errors
    ///
    /// Fails if the principal is empty, contains whitespace, has more than
    /// one `@` or `/`, or has an empty component.
    pub fn parse(raw: &str) -> Result<Self, InvalidPrincipal> {
        if raw.is_empty() {
            return Err(invalid_principal(raw, "empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid_principal(raw, "contains whitespace"));
        }

        let (name, realm) = match raw.split_once('@') {
            Some((_, realm)) if realm.contains('@') => {
                return Err(invalid_principal(raw, "more than one realm separator"))
            }
            Some((_, "")) => return Err(invalid_principal(raw, "empty realm")),
            Some((name, realm)) => (name, Some(realm.to_owned())),
            None => (raw, None),
        };

        let (primary, instance) = match name.split_once('/') {
            Some((_, instance)) if instance.contains('/') => {
                return Err(invalid_principal(raw, "more than one instance separator"))
            }
            Some((_, "")) => return Err(invalid_principal(raw, "empty instance")),
            Some((primary, instance)) => (primary, Some(instance.to_owned())),
            None => (name, None),
        };

        if primary.is_empty() {
            return Err(invalid_principal(raw, "empty primary"));
        }

        Ok(Self {
            raw: raw.to_owned(),
            primary: primary.to_owned(),
            instance,
            realm,
        })
    }

    /// The full principal as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The primary component
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// The instance component, if any
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// The realm component, if any
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn attribute(&self, attr: Attribute) -> &str {
        match attr {
            Attribute::Principal => &self.raw,
            Attribute::Primary => &self.primary,
            Attribute::Instance => self.instance.as_deref().unwrap_or_default(),
            Attribute::Realm => self.realm.as_deref().unwrap_or_default(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A mapping rule as written in configuration
///
/// Conditions are `true` or comparisons of one of the attributes
/// `principal`, `primary`, `instance` and `realm` against a single-quoted
/// literal using `==`, `!=` or `=~` (regular expression match), joined with
/// `&&`. Templates substitute the same attributes written in braces.
///
/// ```json
/// { "if": "realm == 'EXAMPLE.COM' && instance == ''", "then": "{primary}@example.com" }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    /// The predicate deciding whether the rule applies
    #[serde(rename = "if")]
    pub condition: String,
    /// The template rendering the identity
    #[serde(rename = "then")]
    pub template: String,
}

/// A mapping rule that failed to compile
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidMappingRule {
    /// The predicate could not be parsed
    #[error("unable to parse condition `{condition}` near `{near}`")]
    Condition {
        /// The full predicate
        condition: String,
        /// The term that could not be parsed
        near: String,
    },
    /// The template referenced an unknown attribute or had unbalanced braces
    #[error("invalid template `{template}`")]
    Template {
        /// The full template
        template: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attribute {
    Principal,
    Primary,
    Instance,
    Realm,
}

impl Attribute {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "principal" => Some(Self::Principal),
            "primary" => Some(Self::Primary),
            "instance" => Some(Self::Instance),
            "realm" => Some(Self::Realm),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
enum Term {
    Always,
    Equals(Attribute, String),
    NotEquals(Attribute, String),
    Matches(Attribute, Regex),
}

enum Operator {
    Equals,
    NotEquals,
    Matches,
}

impl Term {
    fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "true" {
            return Some(Self::Always);
        }

        let (lhs, rhs, op) = if let Some((lhs, rhs)) = s.split_once("!=") {
            (lhs, rhs, Operator::NotEquals)
        } else if let Some((lhs, rhs)) = s.split_once("=~") {
            (lhs, rhs, Operator::Matches)
        } else {
            let (lhs, rhs) = s.split_once("==")?;
            (lhs, rhs, Operator::Equals)
        };

        let attr = Attribute::parse(lhs.trim())?;
        let literal = rhs
            .trim()
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))?;
        if literal.contains('\'') {
            return None;
        }

        Some(match op {
            Operator::Equals => Self::Equals(attr, literal.to_owned()),
            Operator::NotEquals => Self::NotEquals(attr, literal.to_owned()),
            Operator::Matches => Self::Matches(attr, Regex::new(literal).ok()?),
        })
    }

    fn holds(&self, principal: &Principal) -> bool {
        match self {
            Self::Always => true,
            Self::Equals(attr, lit) => principal.attribute(*attr) == lit,
            Self::NotEquals(attr, lit) => principal.attribute(*attr) != lit,
            Self::Matches(attr, re) => re.is_match(principal.attribute(*attr)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Attribute(Attribute),
}

#[derive(Clone, Debug)]
struct CompiledRule {
    terms: Vec<Term>,
    template: Vec<Segment>,
}

impl CompiledRule {
    fn compile(rule: &MappingRule) -> Result<Self, InvalidMappingRule> {
        let terms = rule
            .condition
            .split("&&")
            .map(|t| {
                Term::parse(t).ok_or_else(|| InvalidMappingRule::Condition {
                    condition: rule.condition.clone(),
                    near: t.trim().to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let template = compile_template(&rule.template).ok_or_else(|| {
            InvalidMappingRule::Template {
                template: rule.template.clone(),
            }
        })?;

        Ok(Self { terms, template })
    }

    fn apply(&self, principal: &Principal) -> Option<String> {
        if !self.terms.iter().all(|t| t.holds(principal)) {
            return None;
        }

        let mut rendered = String::new();
        for segment in &self.template {
            match segment {
                Segment::Literal(lit) => rendered.push_str(lit),
                Segment::Attribute(attr) => rendered.push_str(principal.attribute(*attr)),
            }
        }
        Some(rendered)
    }
}

fn compile_template(template: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find(['{', '}']) {
        if rest[open..].starts_with('}') {
            return None;
        }
        if open > 0 {
            segments.push(Segment::Literal(rest[..open].to_owned()));
        }
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        segments.push(Segment::Attribute(Attribute::parse(&after[..close])?));
        rest = &after[close + 1..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_owned()));
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// Maps authenticated principals to the identities known by the minting
/// service
///
/// Rules are evaluated in order and the first rule whose predicate holds
/// renders the identity. With no rules configured, every principal maps to
/// itself.
#[derive(Clone, Debug, Default)]
pub struct UserMapper {
    rules: Vec<CompiledRule>,
}

impl UserMapper {
    /// Compiles a list of mapping rules
    ///
    /// # Errors
    ///
    /// Fails on the first rule whose predicate or template cannot be parsed.
    pub fn new(rules: &[MappingRule]) -> Result<Self, InvalidMappingRule> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Maps a principal to an identity
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if the principal cannot be parsed or no
    /// rule applies to it.
    pub fn map(&self, raw: &str) -> Result<Identity, Status> {
        let principal =
            Principal::parse(raw).map_err(|err| Status::invalid_argument(err.to_string()))?;

        if self.rules.is_empty() {
            return Ok(Identity::new(principal.as_str().to_owned()));
        }

        self.rules
            .iter()
            .find_map(|rule| rule.apply(&principal))
            .map(Identity::from)
            .ok_or_else(|| {
                Status::invalid_argument(format!("Principal `{principal}` cannot be mapped"))
            })
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;
    use crate::Code;

    fn rule(condition: &str, template: &str) -> MappingRule {
        MappingRule {
            condition: condition.to_owned(),
            template: template.to_owned(),
        }
    }

    #[test]
    fn parses_kerberos_principals() -> Result<()> {
        let p = Principal::parse("yarn/host.example.com@FOO.BAR")?;
        assert_eq!(p.primary(), "yarn");
        assert_eq!(p.instance(), Some("host.example.com"));
        assert_eq!(p.realm(), Some("FOO.BAR"));

        let p = Principal::parse("alice")?;
        assert_eq!(p.primary(), "alice");
        assert_eq!(p.instance(), None);
        assert_eq!(p.realm(), None);
        Ok(())
    }

    #[test]
    fn rejects_malformed_principals() {
        for raw in ["", "a@b@c", "@REALM", "alice@", "a/b/c@R", "al ice@R", "a/@R"] {
            assert!(Principal::parse(raw).is_err(), "{raw:?} should not parse");
        }
    }

    #[test]
    fn identity_mapping_without_rules() -> Result<()> {
        let mapper = UserMapper::default();
        assert_eq!(mapper.map("alice@EXAMPLE.COM")?.as_str(), "alice@EXAMPLE.COM");
        assert_eq!(
            mapper.map("a@b@c").unwrap_err().code(),
            Code::InvalidArgument
        );
        Ok(())
    }

    #[test]
    fn first_matching_rule_wins() -> Result<()> {
        let mapper = UserMapper::new(&[
            rule("realm == 'EXAMPLE.COM' && instance == ''", "{primary}@example.com"),
            rule("realm == 'FOO.BAR'", "{primary}-{instance}@foo.example"),
            rule("true", "{primary}@fallback.example"),
        ])?;

        assert_eq!(mapper.map("alice@EXAMPLE.COM")?.as_str(), "alice@example.com");
        assert_eq!(
            mapper.map("yarn/node1@FOO.BAR")?.as_str(),
            "yarn-node1@foo.example"
        );
        assert_eq!(
            mapper.map("svc/node1@EXAMPLE.COM")?.as_str(),
            "svc@fallback.example"
        );
        Ok(())
    }

    #[test]
    fn regular_expression_predicates() -> Result<()> {
        let mapper = UserMapper::new(&[
            rule("realm =~ '^(EXAMPLE|CORP)\\.COM$'", "{primary}@example.com"),
            rule("true", "{principal}"),
        ])?;

        assert_eq!(mapper.map("bob@CORP.COM")?.as_str(), "bob@example.com");
        assert_eq!(mapper.map("bob@CORPXCOM")?.as_str(), "bob@CORPXCOM");
        Ok(())
    }

    #[test]
    fn unmatched_principal_is_invalid() -> Result<()> {
        let mapper = UserMapper::new(&[rule("realm != 'OTHER'", "{primary}@example.com")])?;
        let err = mapper.map("bob@OTHER").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().contains("bob@OTHER"));
        Ok(())
    }

    #[test]
    fn rejects_bad_rules() {
        assert!(matches!(
            UserMapper::new(&[rule("realm ~= 'X'", "{primary}")]),
            Err(InvalidMappingRule::Condition { .. })
        ));
        assert!(matches!(
            UserMapper::new(&[rule("primary == unquoted", "{primary}")]),
            Err(InvalidMappingRule::Condition { .. })
        ));
        assert!(matches!(
            UserMapper::new(&[rule("primary =~ '(unclosed'", "{primary}")]),
            Err(InvalidMappingRule::Condition { .. })
        ));
        assert!(matches!(
            UserMapper::new(&[rule("true", "{username}@example.com")]),
            Err(InvalidMappingRule::Template { .. })
        ));
        assert!(matches!(
            UserMapper::new(&[rule("true", "{primary@example.com")]),
            Err(InvalidMappingRule::Template { .. })
        ));
    }
}
