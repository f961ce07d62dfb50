use crate::prelude::*;
use derivative::Derivative;

/// A distribution name, normalized per PEP 503: runs of `-`, `_`, and `.`
/// collapse to a single `-`, everything lowercased. The spelling the user
/// gave us is kept around for display.
#[derive(Debug, Clone, DeserializeFromStr, Derivative)]
#[derivative(Hash, PartialEq, Eq)]
pub struct ProjectName {
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    raw: String,
    normalized: String,
}

impl ProjectName {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl TryFrom<&str> for ProjectName {
    type Error = eyre::Report;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        // https://packaging.python.org/specifications/core-metadata/#name
        static NAME_VALIDATE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });
        // https://www.python.org/dev/peps/pep-0503/#normalized-names
        static NAME_NORMALIZE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"[-_.]+").unwrap());

        if !NAME_VALIDATE.is_match(raw) {
            bail!("invalid project name {:?}", raw);
        }

        let mut normalized = NAME_NORMALIZE.replace_all(raw, "-").to_string();
        normalized.make_ascii_lowercase();

        Ok(ProjectName {
            raw: raw.to_owned(),
            normalized,
        })
    }
}

try_from_str_boilerplate!(ProjectName);

impl Display for ProjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pep503_normalization() {
        for (raw, normalized) in [
            ("PyYAML", "pyyaml"),
            ("twitter.commons.lang", "twitter-commons-lang"),
            ("foo-_.bar_baz", "foo-bar-baz"),
            ("cowsay", "cowsay"),
        ] {
            let name: ProjectName = raw.try_into().unwrap();
            assert_eq!(name.raw(), raw);
            assert_eq!(name.normalized(), normalized);
        }
    }

    #[test]
    fn test_equality_is_on_normalized_form() {
        let a: ProjectName = "Foo-Bar-Baz".try_into().unwrap();
        let b: ProjectName = "foo_bar.baz".try_into().unwrap();
        let c: ProjectName = "foo-barbaz".try_into().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_validation() {
        for bad in ["", "foo bar", "foo!", "-foo", "foo-"] {
            let result: Result<ProjectName> = bad.try_into();
            assert!(result.is_err(), "should reject {:?}", bad);
        }
    }
}
