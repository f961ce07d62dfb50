use crate::prelude::*;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

// A PEP 440 version, parsed by hand. We used to lean on a third-party crate
// for this, but we need control over wildcard handling (the `==3.9.*` forms
// only make sense inside specifiers) and over exactly which suffixes are
// accepted, so the parser lives here now.
//
// Ordering caveat: only `(epoch, release)` participate in comparisons. The
// pre/post/dev/local suffixes are parsed, carried, and rendered canonically,
// but they do NOT affect Eq/Ord/Hash yet. TODO: full PEP 440 suffix ordering,
// needed before pre-releases can be compared honestly.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreRelease {
    Alpha,
    Beta,
    Rc,
}

impl PreRelease {
    fn as_str(&self) -> &'static str {
        match self {
            PreRelease::Alpha => "a",
            PreRelease::Beta => "b",
            PreRelease::Rc => "rc",
        }
    }
}

#[derive(Debug, Clone, SerializeDisplay, DeserializeFromStr)]
pub struct Version {
    /// None if the input had no `N!` prefix; compares as 0.
    pub epoch: Option<u32>,
    pub release: Vec<u32>,
    pub pre: Option<(PreRelease, u32)>,
    pub post: Option<u32>,
    pub dev: Option<u32>,
    pub local: Vec<String>,
    raw: String,
}

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^
        v?
        (?:(?P<epoch>[0-9]+)!)?
        (?P<release>[0-9]+(?:\.[0-9]+)*)
        (?P<wildcard>\.\*)?
        (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|rc|c)(?:[-_.]?(?P<pre_n>[0-9]+))?)?
        (?:[-_.]?(?P<post_l>post|rev|r)(?:[-_.]?(?P<post_n>[0-9]+))?)?
        (?:[-_.]?(?P<dev_l>dev)(?:[-_.]?(?P<dev_n>[0-9]+))?)?
        (?:\+(?P<local>[a-z0-9]+(?:\.[a-z0-9]+)*))?
        $",
    )
    .unwrap()
});

fn parse_u32(digits: &str, whole: &str) -> Result<u32> {
    digits
        .parse()
        .map_err(|_| CzexError::InvalidVersion(whole.to_owned()).into())
}

impl Version {
    /// Parse a plain version; `*` wildcards are rejected. Specifier clauses
    /// that allow wildcards go through [`Version::parse_wildcard`].
    pub fn parse(input: &str) -> Result<Version> {
        let (version, wildcard) = Version::parse_wildcard(input)?;
        if wildcard {
            return Err(CzexError::InvalidVersion(input.trim().to_owned()).into());
        }
        Ok(version)
    }

    /// Parse a version that may end in `.*`. The boolean reports whether it
    /// did; the wildcard terminates the version, so something like `1.0.*rc1`
    /// is an error.
    pub fn parse_wildcard(input: &str) -> Result<(Version, bool)> {
        let raw = input.trim();
        let invalid = || -> eyre::Report { CzexError::InvalidVersion(raw.to_owned()).into() };
        let lowered = raw.to_ascii_lowercase();
        let captures = VERSION_RE.captures(&lowered).ok_or_else(invalid)?;

        let epoch = match captures.name("epoch") {
            Some(m) => Some(parse_u32(m.as_str(), raw)?),
            None => None,
        };
        let release = captures
            .name("release")
            .unwrap()
            .as_str()
            .split('.')
            .map(|segment| parse_u32(segment, raw))
            .collect::<Result<Vec<u32>>>()?;
        let wildcard = captures.name("wildcard").is_some();

        let suffix_number = |name: &str| -> Result<u32> {
            match captures.name(name) {
                Some(m) => parse_u32(m.as_str(), raw),
                None => Ok(0),
            }
        };
        let pre = match captures.name("pre_l") {
            Some(m) => {
                let kind = match m.as_str() {
                    "a" | "alpha" => PreRelease::Alpha,
                    "b" | "beta" => PreRelease::Beta,
                    "rc" | "c" | "pre" | "preview" => PreRelease::Rc,
                    _ => unreachable!(),
                };
                Some((kind, suffix_number("pre_n")?))
            }
            None => None,
        };
        let post = match captures.name("post_l") {
            Some(_) => Some(suffix_number("post_n")?),
            None => None,
        };
        let dev = match captures.name("dev_l") {
            Some(_) => Some(suffix_number("dev_n")?),
            None => None,
        };
        let local = match captures.name("local") {
            Some(m) => m.as_str().split('.').map(|s| s.to_owned()).collect(),
            None => vec![],
        };

        if wildcard && (pre.is_some() || post.is_some() || dev.is_some() || !local.is_empty())
        {
            return Err(invalid());
        }

        Ok((
            Version {
                epoch,
                release,
                pre,
                post,
                dev,
                local,
                raw: raw.to_owned(),
            },
            wildcard,
        ))
    }

    /// Build a plain release-only version, e.g. for synthesized `X.Y` pairs.
    pub fn from_release(release: Vec<u32>) -> Version {
        let mut version = Version {
            epoch: None,
            release,
            pre: None,
            post: None,
            dev: None,
            local: vec![],
            raw: String::new(),
        };
        version.raw = version.to_string();
        version
    }

    /// The input as given (whitespace-trimmed), for `===` comparisons.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Release with trailing zeros dropped; comparing these lexicographically
    /// is the same as comparing zero-padded tuples.
    fn trimmed_release(&self) -> &[u32] {
        let mut end = self.release.len();
        while end > 0 && self.release[end - 1] == 0 {
            end -= 1;
        }
        &self.release[..end]
    }

    fn cmp_key(&self) -> (u32, &[u32]) {
        (self.epoch.unwrap_or(0), self.trimmed_release())
    }

    /// Zero-padded release segment.
    pub fn release_segment(&self, index: usize) -> u32 {
        self.release.get(index).copied().unwrap_or(0)
    }
}

impl TryFrom<&str> for Version {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Version::parse(value)
    }
}

try_from_str_boilerplate!(Version);

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key().cmp(&other.cmp_key())
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cmp_key().hash(state);
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}!", epoch)?;
        }
        let mut first = true;
        for segment in &self.release {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            write!(f, "{}", segment)?;
        }
        if let Some((kind, n)) = &self.pre {
            write!(f, "{}{}", kind.as_str(), n)?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{}", n)?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{}", n)?;
        }
        if !self.local.is_empty() {
            write!(f, "+{}", self.local.join("."))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_version_canonical_format() {
        for (input, canonical) in [
            ("1.2.3", "1.2.3"),
            ("v0!1.2.3", "0!1.2.3"),
            ("1.2.3.rc0", "1.2.3rc0"),
            ("1.2.3-r3", "1.2.3.post3"),
            ("1.2.3dev4", "1.2.3.dev4"),
            ("V1.0", "1.0"),
            ("2!1.0alpha1", "2!1.0a1"),
            ("1.0.preview-2", "1.0rc2"),
            ("1.0c3", "1.0rc3"),
            ("1.0.post", "1.0.post0"),
            ("1.0.dev", "1.0.dev0"),
            ("1.0+ubuntu.1", "1.0+ubuntu.1"),
            (" 1.2.3 ", "1.2.3"),
        ] {
            let parsed = v(input);
            let rendered = parsed.to_string();
            assert_eq!(rendered, canonical, "formatting {:?}", input);
            // the canonical form reparses to an equal version
            assert_eq!(v(&rendered), parsed);
        }
    }

    #[test]
    fn test_version_invalid() {
        for bad in [
            "",
            "abc",
            "1.2.3.*", // wildcard needs explicit opt-in
            "1.*.3",
            "1.2.3!4", // epoch goes up front
            "1.2.3junk",
            "1.2.3..4",
            "1.2.3+",
            "1.2.3+foo..bar",
            "1.2.3+foo.",
            "-1.2",
        ] {
            assert!(Version::parse(bad).is_err(), "should reject {:?}", bad);
        }
    }

    #[test]
    fn test_version_wildcard_parse() {
        let (version, wildcard) = Version::parse_wildcard("3.9.*").unwrap();
        assert!(wildcard);
        assert_eq!(version.release, vec![3, 9]);

        let (_, wildcard) = Version::parse_wildcard("3.9").unwrap();
        assert!(!wildcard);

        // wildcard must terminate the version
        assert!(Version::parse_wildcard("1.0.*rc1").is_err());
        // and only appears right after a dot
        assert!(Version::parse_wildcard("1.0*").is_err());
    }

    #[test]
    fn test_version_ordering_is_release_level() {
        assert!(v("3.8") < v("3.9"));
        assert!(v("3.9") < v("3.10"));
        assert!(v("3.10") < v("3.13.5"));
        assert_eq!(v("3.9"), v("3.9.0"));
        assert_eq!(v("3.9"), v("3.9.0.0"));
        assert!(v("0!3.9") < v("1!3.9"));
        assert_eq!(v("0!3.9"), v("3.9"));
        // documented incompleteness: suffixes don't order (yet)
        assert_eq!(v("1.2.3rc0"), v("1.2.3"));
    }

    #[test]
    fn test_version_raw_preserved() {
        assert_eq!(v(" v1.0-r3 ").raw(), "v1.0-r3");
    }

    #[test]
    fn test_version_hash_consistent_with_eq() {
        use std::collections::hash_map::DefaultHasher;

        fn hash_of(version: &Version) -> u64 {
            let mut h = DefaultHasher::new();
            version.hash(&mut h);
            h.finish()
        }

        assert_eq!(hash_of(&v("3.9")), hash_of(&v("3.9.0")));
        assert_eq!(hash_of(&v("3.9")), hash_of(&v("0!3.9")));
    }
}
