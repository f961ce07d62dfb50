use crate::prelude::*;
use std::path::PathBuf;
use std::slice::SliceIndex;
use typed_path::unix::UnixComponent;
use typed_path::UnixPath;

// Archive entry names become NicePathBufs before they touch the filesystem:
// guaranteed to be relative, contained within the parent directory, normalized
// (by being a Vec), valid filenames across Windows/macOS/Linux, valid utf8. We
// don't currently rule out all the Windows device names though (CON, LPT,
// etc.).
#[derive(Debug, PartialEq, Eq, Clone, DeserializeFromStr, SerializeDisplay)]
pub struct NicePathBuf {
    pieces: Vec<String>,
}

// https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
const NAUGHTY_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn check_path_piece(piece: &[u8]) -> Result<&str> {
    let piece = std::str::from_utf8(piece)?;
    if piece.is_empty() {
        bail!("path components must be non-empty");
    }
    if piece.contains(&*NAUGHTY_CHARS) {
        bail!("invalid or non-portable characters in path component {piece:?}");
    }
    if piece.contains(|c: char| c.is_ascii_control()) {
        bail!("invalid or non-portable characters in path component {piece:?}");
    }
    if piece.ends_with('.') || piece.ends_with(' ') {
        bail!("invalid or non-portable path component {piece:?}");
    }
    Ok(piece)
}

impl NicePathBuf {
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn to_native(&self) -> PathBuf {
        self.into()
    }

    /// Is `other` equal to or underneath self?
    pub fn contains(&self, other: &NicePathBuf) -> bool {
        other.pieces.starts_with(&self.pieces)
    }

    pub fn join(&self, other: &NicePathBuf) -> NicePathBuf {
        let mut pieces = self.pieces.clone();
        pieces.extend(other.pieces.iter().cloned());
        NicePathBuf { pieces }
    }

    pub fn pieces(&self) -> &[String] {
        self.pieces.as_slice()
    }

    pub fn slice<I>(&self, index: I) -> NicePathBuf
    where
        I: SliceIndex<[String], Output = [String]>,
    {
        NicePathBuf {
            pieces: self.pieces[index].into(),
        }
    }
}

impl Display for NicePathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pieces.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.pieces.as_slice().join("/"))
        }
    }
}

impl TryFrom<&UnixPath> for NicePathBuf {
    type Error = eyre::Report;

    fn try_from(value: &UnixPath) -> Result<Self, Self::Error> {
        context!("validating path {}", value.display());
        let mut new = NicePathBuf { pieces: vec![] };
        for c in value.components() {
            match c {
                UnixComponent::RootDir => bail!("expected relative path"),
                UnixComponent::CurDir => (),
                UnixComponent::ParentDir => {
                    if !new.pieces.is_empty() {
                        new.pieces.pop();
                    } else {
                        bail!("path escapes parent directory");
                    }
                }
                UnixComponent::Normal(piece) => {
                    new.pieces.push(check_path_piece(piece)?.into());
                }
            }
        }
        Ok(new)
    }
}

impl TryFrom<&str> for NicePathBuf {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

try_from_str_boilerplate!(NicePathBuf);

impl TryFrom<&[u8]> for NicePathBuf {
    type Error = eyre::Report;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        UnixPath::new(value).try_into()
    }
}

impl From<&NicePathBuf> for PathBuf {
    fn from(value: &NicePathBuf) -> Self {
        let mut path = PathBuf::new();
        for piece in &value.pieces {
            path.push(piece);
        }
        path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nice_path_buf() {
        for bad in [
            "foo/../../bar",
            "../foo",
            "/nope",
            "c:\\bad",
            "not\\good",
            "what\x00",
        ] {
            assert!(TryInto::<NicePathBuf>::try_into(bad).is_err());
        }

        for (input, normed) in [
            ("foo/bar/baz/", "foo/bar/baz"),
            ("foo/.././//baz", "baz"),
            (".///.", "."),
        ] {
            assert_eq!(
                TryInto::<NicePathBuf>::try_into(input).unwrap().to_string(),
                normed.to_string()
            );
        }
    }

    #[test]
    fn test_contains_and_slice() {
        let deps: NicePathBuf = ".deps/cowsay-6.0-py2.py3-none-any.whl".try_into().unwrap();
        let inner: NicePathBuf = ".deps/cowsay-6.0-py2.py3-none-any.whl/cowsay/__init__.py"
            .try_into()
            .unwrap();
        assert!(deps.contains(&inner));
        assert!(!inner.contains(&deps));
        assert_eq!(inner.slice(2..).to_string(), "cowsay/__init__.py");
    }
}
