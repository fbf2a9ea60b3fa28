//! Dependency manifest parsing and deterministic resolution.

use super::version::Version;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Compatible,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            ">=" => Operator::Ge,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            "~=" => Operator::Compatible,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Compatible => "~=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub op: Operator,
    pub version: Version,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// One manifest line.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Normalized project name.
    pub name: String,
    /// Extras, e.g. `speedups` in `aiohttp[speedups]`.
    pub extras: Vec<String>,
    pub constraints: Vec<Constraint>,
    /// Environment marker, passed through untouched.
    pub marker: Option<String>,
    /// `--hash=` values.
    pub hashes: Vec<String>,
    pub line: usize,
}

/// Declarative list of requirements, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
}

/// One package of the resolved set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    /// Exact version when the constraints pin one.
    pub version: Option<String>,
    /// Requirement specifier handed to the installer.
    pub spec: String,
    pub hashes: Vec<String>,
}

/// Concrete set of packages to install, keyed by normalized name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSet {
    pub packages: BTreeMap<String, ResolvedPackage>,
}

impl ResolvedSet {
    /// Stable digest of the set; equal manifests produce equal digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for package in self.packages.values() {
            hasher.update(package.spec.as_bytes());
            for hash in &package.hashes {
                hasher.update(b" ");
                hasher.update(hash.as_bytes());
            }
            hasher.update(b"\n");
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Every package carries at least one hash.
    pub fn fully_hashed(&self) -> bool {
        !self.packages.is_empty() && self.packages.values().all(|p| !p.hashes.is_empty())
    }

    /// Requirements file content for the installer.
    pub fn to_requirements(&self) -> String {
        let mut out = String::new();
        for package in self.packages.values() {
            out.push_str(&package.spec);
            for hash in &package.hashes {
                out.push_str(" --hash=");
                out.push_str(hash);
            }
            out.push('\n');
        }
        out
    }
}

/// PEP 503 normalization: lowercase, runs of `-`, `_`, `.` become `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

fn requirement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<spec>[^;]*?)\s*(?:;\s*(?P<marker>.+))?$")
            .expect("requirement regex is valid")
    })
}

fn constraint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<op>===|==|!=|~=|>=|<=|>|<)\s*(?P<version>\S+)$")
            .expect("constraint regex is valid")
    })
}

impl DependencyManifest {
    /// Read and parse a manifest file.
    pub fn load(path: &std::path::Path) -> BotstrapResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BotstrapError::Resolution(format!(
                "cannot read dependency manifest {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    /// Parse a pip-style lock manifest.
    ///
    /// Supports comments, `\` continuations and `--hash=` options. Other
    /// options (`-r`, `-e`, `--index-url`, …) are rejected: the manifest
    /// must be self-contained.
    pub fn parse(text: &str) -> BotstrapResult<Self> {
        let mut requirements = Vec::new();
        let mut pending = String::new();
        let mut start_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line = strip_comment(raw);
            if pending.is_empty() {
                start_line = index + 1;
            }

            let trimmed = line.trim_end();
            if let Some(head) = trimmed.strip_suffix('\\') {
                pending.push_str(head);
                pending.push(' ');
                continue;
            }
            pending.push_str(trimmed);

            let logical = std::mem::take(&mut pending);
            let logical = logical.trim();
            if logical.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(logical, start_line)?);
        }

        if !pending.trim().is_empty() {
            requirements.push(parse_requirement(pending.trim(), start_line)?);
        }

        Ok(Self { requirements })
    }

    /// Resolve the manifest into a concrete set.
    ///
    /// Constraints on the same package (across lines) are intersected. An
    /// empty intersection is a resolution error. With `require_pins`, every
    /// package must be pinned to exactly one version.
    pub fn resolve(&self, require_pins: bool) -> BotstrapResult<ResolvedSet> {
        let mut grouped: BTreeMap<String, Vec<&Requirement>> = BTreeMap::new();
        for req in &self.requirements {
            grouped.entry(req.name.clone()).or_default().push(req);
        }

        let mut packages = BTreeMap::new();
        for (name, reqs) in grouped {
            let constraints: Vec<&Constraint> =
                reqs.iter().flat_map(|r| r.constraints.iter()).collect();
            let pinned = check_satisfiable(&name, &constraints)?;

            if require_pins && pinned.is_none() {
                return Err(BotstrapError::Resolution(format!(
                    "{} (line {}) is not pinned to an exact version",
                    name, reqs[0].line
                )));
            }

            let mut extras: Vec<String> = reqs.iter().flat_map(|r| r.extras.clone()).collect();
            extras.sort();
            extras.dedup();
            let marker = reqs.iter().find_map(|r| r.marker.clone());
            let mut hashes: Vec<String> = reqs.iter().flat_map(|r| r.hashes.clone()).collect();
            hashes.sort();
            hashes.dedup();

            let mut spec = name.clone();
            if !extras.is_empty() {
                spec.push_str(&format!("[{}]", extras.join(",")));
            }
            match &pinned {
                Some(version) => spec.push_str(&format!("=={}", version)),
                None => {
                    let mut rendered: Vec<String> =
                        constraints.iter().map(|c| c.to_string()).collect();
                    rendered.sort();
                    rendered.dedup();
                    spec.push_str(&rendered.join(","));
                }
            }
            if let Some(marker) = marker {
                spec.push_str(&format!("; {}", marker));
            }

            packages.insert(
                name.clone(),
                ResolvedPackage {
                    name,
                    version: pinned.map(|v| v.to_string()),
                    spec,
                    hashes,
                },
            );
        }

        Ok(ResolvedSet { packages })
    }
}

fn parse_requirement(logical: &str, line: usize) -> BotstrapResult<Requirement> {
    let mut hashes = Vec::new();
    let mut body = Vec::new();
    for token in logical.split_whitespace() {
        if let Some(hash) = token.strip_prefix("--hash=") {
            hashes.push(hash.to_string());
        } else if token.starts_with('-') {
            return Err(BotstrapError::Resolution(format!(
                "line {}: option '{}' is not supported in a lock manifest",
                line, token
            )));
        } else {
            body.push(token);
        }
    }
    let body = body.join(" ");

    let caps = requirement_regex().captures(&body).ok_or_else(|| {
        BotstrapError::Resolution(format!("line {}: cannot parse requirement '{}'", line, body))
    })?;

    let name = normalize_name(&caps["name"]);
    let extras = caps
        .name("extras")
        .map(|m| {
            m.as_str()
                .split(',')
                .map(|e| normalize_name(e.trim()))
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut constraints = Vec::new();
    let spec = caps.name("spec").map(|m| m.as_str().trim()).unwrap_or("");
    if !spec.is_empty() {
        for part in spec.split(',') {
            let part = part.trim();
            let c = constraint_regex().captures(part).ok_or_else(|| {
                BotstrapError::Resolution(format!(
                    "line {}: invalid constraint '{}' for {}",
                    line, part, name
                ))
            })?;
            let op = Operator::parse(&c["op"]).ok_or_else(|| {
                BotstrapError::Resolution(format!(
                    "line {}: operator '{}' is not supported",
                    line, &c["op"]
                ))
            })?;
            if c["version"].contains('*') {
                return Err(BotstrapError::Resolution(format!(
                    "line {}: wildcard versions are not supported ({})",
                    line, part
                )));
            }
            let version = c["version"]
                .parse::<Version>()
                .map_err(|e| BotstrapError::Resolution(format!("line {}: {}", line, e)))?;
            if op == Operator::Compatible && version.compatible_upper().is_none() {
                let why = if version.release().len() < 2 {
                    "needs at least two release components"
                } else {
                    "upper bound is out of range"
                };
                return Err(BotstrapError::Resolution(format!(
                    "line {}: '~=' {} ({})",
                    line, why, part
                )));
            }
            constraints.push(Constraint { op, version });
        }
    }

    Ok(Requirement {
        name,
        extras,
        constraints,
        marker: caps.name("marker").map(|m| m.as_str().trim().to_string()),
        hashes,
        line,
    })
}

/// Cut a line at the first `#` that starts it or follows whitespace.
fn strip_comment(raw: &str) -> &str {
    let mut previous: Option<char> = None;
    for (pos, ch) in raw.char_indices() {
        if ch == '#' && previous.is_none_or(char::is_whitespace) {
            return &raw[..pos];
        }
        previous = Some(ch);
    }
    raw
}

/// Intersect constraints; return the pinned version, if any.
fn check_satisfiable(name: &str, constraints: &[&Constraint]) -> BotstrapResult<Option<Version>> {
    let unsatisfiable = |why: String| {
        BotstrapError::Resolution(format!(
            "{}: constraints {} are unsatisfiable ({})",
            name,
            constraints
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
            why
        ))
    };

    // (version, inclusive)
    let mut lower: Option<(Version, bool)> = None;
    let mut upper: Option<(Version, bool)> = None;
    let mut pin: Option<Version> = None;
    let mut excluded = Vec::new();

    let raise_lower = |v: &Version, inclusive: bool, lower: &mut Option<(Version, bool)>| {
        let tighter = match lower.as_ref() {
            None => true,
            Some((cur, cur_inc)) => v > cur || (v == cur && *cur_inc && !inclusive),
        };
        if tighter {
            *lower = Some((v.clone(), inclusive));
        }
    };
    let lower_upper = |v: &Version, inclusive: bool, upper: &mut Option<(Version, bool)>| {
        let tighter = match upper.as_ref() {
            None => true,
            Some((cur, cur_inc)) => v < cur || (v == cur && *cur_inc && !inclusive),
        };
        if tighter {
            *upper = Some((v.clone(), inclusive));
        }
    };

    for c in constraints {
        match c.op {
            Operator::Eq => match &pin {
                Some(existing) if existing != &c.version => {
                    return Err(unsatisfiable(format!(
                        "pinned to both {} and {}",
                        existing, c.version
                    )));
                }
                _ => pin = Some(c.version.clone()),
            },
            Operator::Ne => excluded.push(c.version.clone()),
            Operator::Ge => raise_lower(&c.version, true, &mut lower),
            Operator::Gt => raise_lower(&c.version, false, &mut lower),
            Operator::Le => lower_upper(&c.version, true, &mut upper),
            Operator::Lt => lower_upper(&c.version, false, &mut upper),
            Operator::Compatible => {
                raise_lower(&c.version, true, &mut lower);
                if let Some(bound) = c.version.compatible_upper() {
                    lower_upper(&bound, false, &mut upper);
                }
            }
        }
    }

    let within = |v: &Version| {
        let above = match &lower {
            None => true,
            Some((l, inc)) => v > l || (*inc && v == l),
        };
        let below = match &upper {
            None => true,
            Some((u, inc)) => v < u || (*inc && v == u),
        };
        above && below
    };

    if let Some(pinned) = &pin {
        if !within(pinned) {
            return Err(unsatisfiable(format!("{} is outside the allowed range", pinned)));
        }
        if excluded.contains(pinned) {
            return Err(unsatisfiable(format!("{} is excluded", pinned)));
        }
        return Ok(pin);
    }

    if let (Some((l, l_inc)), Some((u, u_inc))) = (&lower, &upper) {
        let empty = l > u || (l == u && !(*l_inc && *u_inc)) || (l == u && excluded.contains(l));
        if empty {
            return Err(unsatisfiable("empty version range".to_string()));
        }
    }

    Ok(None)
}
