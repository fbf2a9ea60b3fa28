//! Package versions (the release/pre/post subset of PEP 440).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PreRelease {
    Alpha(u64),
    Beta(u64),
    Rc(u64),
}

/// A parsed version such as `3.9.5`, `21.0rc1` or `1.0.post2`.
///
/// Trailing zeros in the release are insignificant: `1.0 == 1.0.0`.
#[derive(Debug, Clone)]
pub struct Version {
    release: Vec<u64>,
    pre: Option<PreRelease>,
    post: Option<u64>,
    text: String,
}

impl Version {
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Upper bound for `~=`: drop the last component and bump the new last.
    ///
    /// `~=2.2` → `3`, `~=1.4.5` → `1.5`. `None` with fewer than two
    /// components or when the bumped component does not fit in a `u64`.
    pub fn compatible_upper(&self) -> Option<Version> {
        if self.release.len() < 2 {
            return None;
        }
        let mut release = self.release[..self.release.len() - 1].to_vec();
        let last = release.last_mut()?;
        *last = last.checked_add(1)?;
        let text = release
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Some(Version {
            release,
            pre: None,
            post: None,
            text,
        })
    }

    fn release_cmp(&self, other: &Version) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for i in 0..len {
            let a = self.release.get(i).copied().unwrap_or(0);
            let b = other.release.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let lowered = text.to_ascii_lowercase();
        let mut rest = lowered.strip_prefix('v').unwrap_or(&lowered);

        // Local version labels do not take part in ordering.
        if let Some((public, _local)) = rest.split_once('+') {
            rest = public;
        }

        let mut post = None;
        if let Some((head, tail)) = rest.split_once(".post") {
            post = Some(
                tail.parse::<u64>()
                    .map_err(|_| format!("invalid post-release in '{}'", text))?,
            );
            rest = head;
        }

        let split_at = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (release_part, pre_part) = rest.split_at(split_at);

        if release_part.is_empty() || release_part.ends_with('.') || release_part.starts_with('.') {
            return Err(format!("invalid version '{}'", text));
        }
        let release = release_part
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| format!("invalid version '{}'", text))?;

        let pre = if pre_part.is_empty() {
            None
        } else {
            let (kind, number) = if let Some(n) = pre_part.strip_prefix("rc") {
                ("rc", n)
            } else if let Some(n) = pre_part.strip_prefix('a') {
                ("a", n)
            } else if let Some(n) = pre_part.strip_prefix('b') {
                ("b", n)
            } else {
                return Err(format!("invalid version '{}'", text));
            };
            let number = if number.is_empty() {
                0
            } else {
                number
                    .parse::<u64>()
                    .map_err(|_| format!("invalid pre-release in '{}'", text))?
            };
            Some(match kind {
                "a" => PreRelease::Alpha(number),
                "b" => PreRelease::Beta(number),
                _ => PreRelease::Rc(number),
            })
        };

        Ok(Version {
            release,
            pre,
            post,
            text: text.to_string(),
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release_cmp(other)
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
            .then_with(|| self.post.cmp(&other.post))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.0") == v("1.0.0"));
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.0rc1") < v("2.0"));
        assert!(v("2.0a1") < v("2.0b1"));
        assert!(v("2.0b3") < v("2.0rc1"));
        assert!(v("2.0.post1") > v("2.0"));
        assert!(v("1.0+local") == v("1.0"));
    }

    #[test]
    fn test_invalid() {
        assert!("".parse::<Version>().is_err());
        assert!("1..2".parse::<Version>().is_err());
        assert!("latest".parse::<Version>().is_err());
        assert!("1.0dev".parse::<Version>().is_err());
    }

    #[test]
    fn test_compatible_upper() {
        assert_eq!(v("2.2").compatible_upper().unwrap(), v("3"));
        assert_eq!(v("1.4.5").compatible_upper().unwrap(), v("1.5"));
        assert!(v("1").compatible_upper().is_none());
        assert!(v("1.18446744073709551615.0").compatible_upper().is_none());
        assert_eq!(
            v("18446744073709551614.3").compatible_upper().unwrap(),
            v("18446744073709551615")
        );
    }
}
