use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub op: CompareOp,
    pub value: String,
}

impl Specifier {
    /// Check the clause for problems that only show up once you look at the
    /// value: wildcards under operators that forbid them, `~=` with a single
    /// release segment, unparseable versions.
    pub fn validate(&self) -> Result<()> {
        use CompareOp::*;
        let clause_err = |reason: &str| -> eyre::Report {
            CzexError::InvalidSpecifierClause {
                clause: self.to_string(),
                reason: reason.to_owned(),
            }
            .into()
        };
        match self.op {
            // === takes an arbitrary string; nothing to check.
            ArbitraryEqual => Ok(()),
            Equal | NotEqual => {
                Version::parse_wildcard(&self.value)?;
                Ok(())
            }
            Compatible => {
                let (version, wildcard) = Version::parse_wildcard(&self.value)?;
                if wildcard {
                    return Err(clause_err("~= cannot take a wildcard"));
                }
                if version.release.len() < 2 {
                    return Err(clause_err(
                        "~= requires a version with at least two release segments",
                    ));
                }
                Ok(())
            }
            _ => {
                let (_, wildcard) = Version::parse_wildcard(&self.value)?;
                if wildcard {
                    return Err(clause_err("only == and != can take a wildcard"));
                }
                Ok(())
            }
        }
    }

    pub fn satisfied_by(&self, candidate: &Version) -> Result<bool> {
        use CompareOp::*;
        self.validate()?;
        Ok(match self.op {
            ArbitraryEqual => self.value.trim() == candidate.raw(),
            Equal | NotEqual => {
                let (version, wildcard) = Version::parse_wildcard(&self.value)?;
                let matched = if wildcard {
                    prefix_matches(&version, candidate)
                } else {
                    candidate == &version
                };
                (self.op == Equal) == matched
            }
            LessThanEqual => {
                candidate <= &Version::parse(&self.value)?
            }
            StrictlyLessThan => candidate < &Version::parse(&self.value)?,
            GreaterThanEqual => candidate >= &Version::parse(&self.value)?,
            StrictlyGreaterThan => candidate > &Version::parse(&self.value)?,
            // ~= X.Y.Z means: same prefix up to the last explicit segment,
            // and at least X.Y.Z.
            Compatible => {
                let version = Version::parse(&self.value)?;
                let prefix_len = version.release.len() - 1;
                let epochs_match =
                    candidate.epoch.unwrap_or(0) == version.epoch.unwrap_or(0);
                let prefix_ok = (0..prefix_len).all(|i| {
                    candidate.release_segment(i) == version.release_segment(i)
                });
                epochs_match && prefix_ok && candidate >= &version
            }
        })
    }
}

/// `==X.Y.*` equality: epochs equal and the release segments up to the
/// wildcard position equal, with the candidate zero-padded as needed.
fn prefix_matches(spec: &Version, candidate: &Version) -> bool {
    if spec.epoch.unwrap_or(0) != candidate.epoch.unwrap_or(0) {
        return false;
    }
    (0..spec.release.len()).all(|i| candidate.release_segment(i) == spec.release_segment(i))
}

impl Display for Specifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op, self.value)
    }
}

/// A comma-separated conjunction of clauses; the empty set matches anything.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr, Default)]
pub struct Specifiers(pub Vec<Specifier>);

impl Specifiers {
    pub fn any() -> Specifiers {
        Specifiers(vec![])
    }

    pub fn satisfied_by(&self, version: &Version) -> Result<bool> {
        for specifier in &self.0 {
            if !specifier.satisfied_by(version)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Display for Specifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for spec in &self.0 {
            if !first {
                write!(f, ",")?
            }
            first = false;
            write!(f, "{}", spec)?
        }
        Ok(())
    }
}

impl TryFrom<&str> for Specifiers {
    type Error = eyre::Report;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        let specifiers = super::reqparse::versionspec(input)
            .map_err(|e| eyre!("{e}"))
            .wrap_err_with(|| {
                format!("failed to parse version specifiers from {:?}", input)
            })?;
        for specifier in &specifiers.0 {
            specifier.validate()?;
        }
        Ok(specifiers)
    }
}

try_from_str_boilerplate!(Specifiers);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompareOp {
    LessThanEqual,
    StrictlyLessThan,
    NotEqual,
    Equal,
    GreaterThanEqual,
    StrictlyGreaterThan,
    Compatible,
    ArbitraryEqual,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use CompareOp::*;
        write!(
            f,
            "{}",
            match self {
                LessThanEqual => "<=",
                StrictlyLessThan => "<",
                NotEqual => "!=",
                Equal => "==",
                GreaterThanEqual => ">=",
                StrictlyGreaterThan => ">",
                Compatible => "~=",
                ArbitraryEqual => "===",
            }
        )
    }
}

impl TryFrom<&str> for CompareOp {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        use CompareOp::*;
        Ok(match value {
            "===" => ArbitraryEqual,
            "==" => Equal,
            "!=" => NotEqual,
            "<=" => LessThanEqual,
            "<" => StrictlyLessThan,
            ">=" => GreaterThanEqual,
            ">" => StrictlyGreaterThan,
            "~=" => Compatible,
            _ => return Err(CzexError::InvalidOperator(value.to_owned()).into()),
        })
    }
}

try_from_str_boilerplate!(CompareOp);

#[cfg(test)]
mod test {
    use super::*;

    fn specs(s: &str) -> Specifiers {
        s.try_into().unwrap()
    }

    fn matches(spec: &str, version: &str) -> bool {
        specs(spec)
            .satisfied_by(&Version::parse(version).unwrap())
            .unwrap()
    }

    #[test]
    fn test_greater_equal_truth_table() {
        for good in ["3.9", "3.9.0", "3.9.23", "3.13", "3.13.5", "0!3.9", "1!3.9"] {
            assert!(matches(">=3.9", good), ">=3.9 should accept {}", good);
        }
        for bad in ["3", "3.8", "3.8.20"] {
            assert!(!matches(">=3.9", bad), ">=3.9 should reject {}", bad);
        }
    }

    #[test]
    fn test_compatible_truth_table() {
        for good in ["3.9", "3.9.0", "3.10", "3.13"] {
            assert!(matches("~=3.9", good), "~=3.9 should accept {}", good);
        }
        for bad in ["2.7", "3", "4"] {
            assert!(!matches("~=3.9", bad), "~=3.9 should reject {}", bad);
        }
    }

    #[test]
    fn test_wildcard_equal_truth_table() {
        for good in ["3.9", "3.9.0", "3.9.23"] {
            assert!(matches("==3.9.*", good), "==3.9.* should accept {}", good);
        }
        for bad in ["3.8", "3.10"] {
            assert!(!matches("==3.9.*", bad), "==3.9.* should reject {}", bad);
        }
        assert!(matches("!=3.9.*", "3.10"));
        assert!(!matches("!=3.9.*", "3.9.2"));
    }

    #[test]
    fn test_exact_equal_pads_releases() {
        assert!(matches("==3.9", "3.9.0"));
        assert!(!matches("==3.9", "3.9.1"));
    }

    #[test]
    fn test_arbitrary_equal_compares_raw_strings() {
        assert!(matches("===3.9", "3.9"));
        // equal as versions, but not as strings
        assert!(!matches("===3.9", "3.9.0"));
        assert!(!matches("===3.9", "v3.9"));
    }

    #[test]
    fn test_conjunction() {
        assert!(matches(">=3.8,<3.11", "3.10.2"));
        assert!(!matches(">=3.8,<3.11", "3.11"));
        assert!(!matches(">=3.8,<3.11", "3.7"));
        // empty set matches everything
        assert!(Specifiers::any()
            .satisfied_by(&Version::parse("1.0").unwrap())
            .unwrap());
    }

    #[test]
    fn test_invalid_clauses() {
        // wildcard only under == and !=
        assert!(specs(">=3.9").satisfied_by(&"3.9".parse().unwrap()).is_ok());
        assert!(Specifiers::try_from(">=3.9.*").is_err());
        assert!(Specifiers::try_from("~=3.9.*").is_err());
        // ~= needs two release segments
        assert!(Specifiers::try_from("~=3").is_err());
        // junk operators never parse
        assert!(Specifiers::try_from("=>3.9").is_err());
        assert!(CompareOp::try_from("=>").is_err());
    }
}
