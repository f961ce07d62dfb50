use crate::prelude::*;

/// A PEP 425 compatibility tag: `(python, abi, platform)`, rendered as
/// `py3-none-any`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct Tag {
    pub python: String,
    pub abi: String,
    pub platform: String,
}

impl Tag {
    pub fn new(python: &str, abi: &str, platform: &str) -> Tag {
        Tag {
            python: python.into(),
            abi: abi.into(),
            platform: platform.into(),
        }
    }
}

impl TryFrom<&str> for Tag {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let pieces: Vec<&str> = value.split('-').collect();
        match pieces.as_slice() {
            [python, abi, platform]
                if !python.is_empty() && !abi.is_empty() && !platform.is_empty() =>
            {
                Ok(Tag::new(python, abi, platform))
            }
            _ => bail!("expected a python-abi-platform triple, not {:?}", value),
        }
    }
}

try_from_str_boilerplate!(Tag);

impl Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.python, self.abi, self.platform)
    }
}

/// An interpreter's supported tags, by preference: the probe emits them most
/// preferred first, and a wheel's rank is the best (smallest) rank any of its
/// tags achieves. A tag with no rank is unsupported.
#[derive(Debug, Clone)]
pub struct RankedTags {
    ranks: HashMap<Tag, usize>,
}

impl RankedTags {
    pub fn from_ordered(tags: &[Tag]) -> RankedTags {
        let mut ranks = HashMap::new();
        for (index, tag) in tags.iter().enumerate() {
            // first occurrence wins
            ranks.entry(tag.clone()).or_insert(index);
        }
        RankedTags { ranks }
    }

    pub fn rank(&self, tag: &Tag) -> Option<usize> {
        self.ranks.get(tag).copied()
    }

    pub fn wheel_rank(&self, wheel: &WheelName) -> Option<usize> {
        wheel.all_tags().iter().filter_map(|t| self.rank(t)).min()
    }
}
