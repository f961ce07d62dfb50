use crate::prelude::*;

// https://packaging.python.org/specifications/binary-distribution-format/#file-name-convention
//
// `<project>-<version>[-<build>]-<python>-<abi>-<platform>.whl`, where each of
// the three tag fields is a `.`-separated set and the wheel serves the full
// cross product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelName {
    pub project: ProjectName,
    pub version: Version,
    pub build: Option<String>,
    pub py_tags: Vec<String>,
    pub abi_tags: Vec<String>,
    pub platform_tags: Vec<String>,
}

impl WheelName {
    /// Expand the compressed tag sets into individual tags, in filename order.
    pub fn all_tags(&self) -> Vec<Tag> {
        let mut tags = Vec::new();
        for py in &self.py_tags {
            for abi in &self.abi_tags {
                for platform in &self.platform_tags {
                    tags.push(Tag::new(py, abi, platform));
                }
            }
        }
        tags
    }
}

fn split_tag_set(piece: &str, name: &str) -> Result<Vec<String>> {
    let tags: Vec<String> = piece.split('.').map(|t| t.to_owned()).collect();
    if tags.iter().any(|t| t.is_empty()) {
        return Err(CzexError::InvalidWheelName {
            name: name.to_owned(),
            reason: format!("empty tag component in {:?}", piece),
        }
        .into());
    }
    Ok(tags)
}

impl TryFrom<&str> for WheelName {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        static VALID_CHARS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.+!-]*$").unwrap());

        let invalid = |reason: String| -> eyre::Report {
            CzexError::InvalidWheelName {
                name: value.to_owned(),
                reason,
            }
            .into()
        };

        // project/version/tags get properly validated by their own
        // constructors; this just rules out the truly ridiculous, like spaces
        // or control characters.
        if !VALID_CHARS.is_match(value) {
            return Err(invalid("invalid characters".into()));
        }
        let stem = value
            .strip_suffix(".whl")
            .ok_or_else(|| invalid("missing .whl suffix".into()))?;

        let mut pieces: Vec<&str> = stem.split('-').collect();

        let build = match pieces.len() {
            5 => None,
            6 => {
                let build_tag = pieces.remove(2);
                if build_tag.is_empty() {
                    return Err(invalid("empty build tag".into()));
                }
                Some(build_tag.to_owned())
            }
            n => {
                return Err(invalid(format!(
                    "expected 5 or 6 dash-separated fields, found {}",
                    n
                )))
            }
        };

        let project: ProjectName = pieces[0]
            .try_into()
            .wrap_err_with(|| format!("invalid wheel filename {:?}", value))?;
        let version: Version = pieces[1]
            .try_into()
            .wrap_err_with(|| format!("invalid wheel filename {:?}", value))?;

        let name = WheelName {
            project,
            version,
            build,
            py_tags: split_tag_set(pieces[2], value)?,
            abi_tags: split_tag_set(pieces[3], value)?,
            platform_tags: split_tag_set(pieces[4], value)?,
        };
        if name.all_tags().is_empty() {
            return Err(invalid("expands to zero tags".into()));
        }
        Ok(name)
    }
}

try_from_str_boilerplate!(WheelName);

impl Display for WheelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.project.raw(), self.version)?;
        if let Some(build) = &self.build {
            write!(f, "-{}", build)?;
        }
        write!(
            f,
            "-{}-{}-{}.whl",
            self.py_tags.join("."),
            self.abi_tags.join("."),
            self.platform_tags.join("."),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wheel_name_basic() {
        let n: WheelName = "cowsay-6.0-py2.py3-none-any.whl".try_into().unwrap();
        assert_eq!(n.project.raw(), "cowsay");
        assert_eq!(n.version, "6.0".parse().unwrap());
        assert_eq!(n.build, None);
        assert_eq!(n.py_tags, vec!["py2", "py3"]);
        assert_eq!(n.abi_tags, vec!["none"]);
        assert_eq!(n.platform_tags, vec!["any"]);
        assert_eq!(
            n.all_tags(),
            vec![Tag::new("py2", "none", "any"), Tag::new("py3", "none", "any")]
        );
        assert_eq!(n.to_string(), "cowsay-6.0-py2.py3-none-any.whl");
    }

    #[test]
    fn test_wheel_name_with_build_tag() {
        let n: WheelName = "cowsay-6.0-abcd1234-py3-none-any.whl".try_into().unwrap();
        assert_eq!(n.build.as_deref(), Some("abcd1234"));
        assert_eq!(n.all_tags(), vec![Tag::new("py3", "none", "any")]);
        assert_eq!(n.to_string(), "cowsay-6.0-abcd1234-py3-none-any.whl");
    }

    #[test]
    fn test_wheel_name_cross_product() {
        let n: WheelName =
            "foo-1.0-py2.py3-none-manylinux_2_17_x86_64.musllinux_1_1_x86_64.whl"
                .try_into()
                .unwrap();
        assert_eq!(n.all_tags().len(), 4);
        assert_eq!(
            n.all_tags()[0],
            Tag::new("py2", "none", "manylinux_2_17_x86_64")
        );
        assert_eq!(
            n.all_tags()[3],
            Tag::new("py3", "none", "musllinux_1_1_x86_64")
        );
    }

    #[test]
    fn test_wheel_name_invalid() {
        for bad in [
            "cowsay-py2.py3-none-any.whl",            // too few fields
            "cowsay-6.0-abcd-extra-py3-none-any.whl", // too many fields
            "cowsay-6.0-py3-none-any.zip",            // wrong suffix
            "cowsay-6.0-py3-none.whl",
            "cowsay-6.0-py3..py2-none-any.whl", // empty tag component
            "cowsay-6.0--none-any.whl",
            "cow say-6.0-py3-none-any.whl",
        ] {
            let result: Result<WheelName> = bad.try_into();
            assert!(result.is_err(), "should reject {:?}", bad);
        }
    }
}
