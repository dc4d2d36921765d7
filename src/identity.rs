//! Capability reference parsing, version normalization, and canonicalization.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// A parsed (but not yet resolved) capability reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    pub alias: Option<String>,
    pub app: String,
    pub cap: String,
    pub version: Option<String>,
    pub raw: String,
}

static ALIAS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").unwrap());
static SEGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._-]*$").unwrap());
static FORBIDDEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[#?\s\x00]").unwrap());

fn reject_illegal(raw: &str) -> Result<()> {
    if FORBIDDEN_RE.is_match(raw) {
        return Err(Error::InvalidReference {
            raw: raw.to_string(),
            reason: "contains a forbidden character (#, ?, whitespace, or NUL)".into(),
        });
    }
    Ok(())
}

fn validate_segment(segment: &str, raw: &str, what: &str) -> Result<()> {
    if !SEGMENT_RE.is_match(segment) {
        return Err(Error::InvalidReference {
            raw: raw.to_string(),
            reason: format!("invalid {what} segment {segment:?}"),
        });
    }
    Ok(())
}

fn validate_alias(alias: &str, raw: &str) -> Result<()> {
    if !ALIAS_RE.is_match(alias) {
        return Err(Error::InvalidReference {
            raw: raw.to_string(),
            reason: format!("invalid alias {alias:?}"),
        });
    }
    Ok(())
}

/// Parses any of the three accepted reference forms:
/// `app/cap[@ver]`, `@alias/app/cap[@ver]`, `cap:@alias/app/cap@ver`.
pub fn parse_reference(s: &str) -> Result<ParsedReference> {
    let raw = s.to_string();
    let trimmed = s.trim();
    reject_illegal(trimmed)?;

    let without_prefix = trimmed.strip_prefix("cap:").unwrap_or(trimmed);

    let (alias, rest) = if let Some(stripped) = without_prefix.strip_prefix('@') {
        match stripped.split_once('/') {
            Some((alias, rest)) => (Some(alias.to_string()), rest),
            None => {
                return Err(Error::InvalidReference {
                    raw,
                    reason: "alias form requires '@alias/app/cap'".into(),
                })
            }
        }
    } else {
        (None, without_prefix)
    };

    if let Some(a) = &alias {
        validate_alias(a, &raw)?;
    }

    let (app, cap_and_version) = rest.split_once('/').ok_or_else(|| Error::InvalidReference {
        raw: raw.clone(),
        reason: "expected '<app>/<cap>'".into(),
    })?;

    let (cap, version) = match cap_and_version.split_once('@') {
        Some((cap, version)) => (cap, Some(version.to_string())),
        None => (cap_and_version, None),
    };

    if app.is_empty() || cap.is_empty() {
        return Err(Error::InvalidReference {
            raw,
            reason: "app and cap segments must be non-empty".into(),
        });
    }

    validate_segment(app, &raw, "app")?;
    validate_segment(cap, &raw, "cap")?;

    Ok(ParsedReference {
        alias,
        app: app.to_string(),
        cap: cap.to_string(),
        version,
        raw,
    })
}

/// Normalizes a version string: strips a leading `v`, pads `MAJOR` and
/// `MAJOR.MINOR` shorthand to full SemVer, passes full SemVer through unchanged.
pub fn normalize_version(s: &str) -> Result<String> {
    let stripped = s.strip_prefix('v').unwrap_or(s);
    if let Ok(v) = semver::Version::parse(stripped) {
        return Ok(v.to_string());
    }

    let parts: Vec<&str> = stripped.split('.').collect();
    let all_numeric = !parts.is_empty() && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !all_numeric {
        return Err(Error::InvalidVersion(s.to_string()));
    }

    match parts.len() {
        1 => Ok(format!("{}.0.0", parts[0])),
        2 => Ok(format!("{}.{}.0", parts[0], parts[1])),
        3 => Ok(format!("{}.{}.{}", parts[0], parts[1], parts[2])),
        _ => Err(Error::InvalidVersion(s.to_string())),
    }
}

/// Options controlling canonicalization of a parsed reference.
pub struct CanonicalizeOptions<'a> {
    pub default_alias: &'a str,
    pub resolved_version: Option<&'a str>,
}

impl Default for CanonicalizeOptions<'_> {
    fn default() -> Self {
        CanonicalizeOptions {
            default_alias: "main",
            resolved_version: None,
        }
    }
}

/// Builds the canonical identity string `cap:@<alias>/<app>/<cap>@<version>`.
pub fn canonicalize(parsed: &ParsedReference, opts: &CanonicalizeOptions<'_>) -> Result<String> {
    let alias = parsed
        .alias
        .clone()
        .unwrap_or_else(|| opts.default_alias.to_string());

    let version_src = parsed
        .version
        .as_deref()
        .or(opts.resolved_version)
        .ok_or_else(|| Error::InvalidReference {
            raw: parsed.raw.clone(),
            reason: "no version available from reference or resolution result".into(),
        })?;
    let version = normalize_version(version_src)?;

    Ok(format!(
        "cap:@{}/{}/{}@{}",
        alias.to_lowercase(),
        parsed.app,
        parsed.cap,
        version
    ))
}
