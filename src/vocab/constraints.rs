use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PythonImpl {
    CPython,
    PyPy,
}

impl PythonImpl {
    pub fn name(&self) -> &'static str {
        match self {
            PythonImpl::CPython => "CPython",
            PythonImpl::PyPy => "PyPy",
        }
    }

    /// Case-insensitive match against an implementation name like the
    /// `platform_python_implementation` marker.
    pub fn matches(&self, implementation: &str) -> bool {
        self.name().eq_ignore_ascii_case(implementation)
    }
}

impl TryFrom<&str> for PythonImpl {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("cpython") {
            Ok(PythonImpl::CPython)
        } else if value.eq_ignore_ascii_case("pypy") {
            Ok(PythonImpl::PyPy)
        } else {
            Err(CzexError::InvalidPythonImpl(value.to_owned()).into())
        }
    }
}

try_from_str_boilerplate!(PythonImpl);

impl Display for PythonImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One clause out of a manifest's `interpreter_constraints` list: an optional
/// implementation name followed by an optional specifier set, e.g.
/// `CPython>=3.8,<4` or `==3.9.*` or just `PyPy`.
#[derive(Debug, Clone, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct InterpreterConstraint {
    pub implementation: Option<PythonImpl>,
    pub specifiers: Specifiers,
}

impl InterpreterConstraint {
    pub fn satisfied_by(&self, implementation: &str, version: &Version) -> Result<bool> {
        if let Some(required) = &self.implementation {
            if !required.matches(implementation) {
                return Ok(false);
            }
        }
        self.specifiers.satisfied_by(version)
    }
}

impl TryFrom<&str> for InterpreterConstraint {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let (name, specifiers) = super::reqparse::constraint(value)
            .map_err(|e| eyre!("{e}"))
            .wrap_err_with(|| {
                format!("failed to parse interpreter constraint from {:?}", value)
            })?;
        for specifier in &specifiers.0 {
            specifier.validate()?;
        }
        let implementation = match name {
            Some(name) => Some(name.try_into()?),
            None => None,
        };
        Ok(InterpreterConstraint {
            implementation,
            specifiers,
        })
    }
}

try_from_str_boilerplate!(InterpreterConstraint);

impl Display for InterpreterConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(implementation) = &self.implementation {
            write!(f, "{}", implementation)?;
        }
        write!(f, "{}", self.specifiers)
    }
}

/// The whole `interpreter_constraints` list. An interpreter is acceptable if
/// it satisfies at least one constraint; the empty list accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterConstraints(pub Vec<InterpreterConstraint>);

impl InterpreterConstraints {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn satisfied_by(&self, implementation: &str, version: &Version) -> Result<bool> {
        if self.0.is_empty() {
            return Ok(true);
        }
        for constraint in &self.0 {
            if constraint.satisfied_by(implementation, version)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Candidate `(major, minor)` pairs worth probing for, in preference
    /// order. The upper bound comes from the newest minor actually observed
    /// among discovered interpreters (floored so an empty search path still
    /// probes a useful range) rather than from any wall-clock guess.
    pub fn matching_versions(&self, newest_minor_seen: Option<u32>) -> Vec<(u32, u32)> {
        const MINOR_FLOOR: u32 = 13;
        let max_minor = newest_minor_seen.unwrap_or(0).max(MINOR_FLOOR);
        let mut candidates: Vec<(u32, u32)> = (5..=max_minor).map(|minor| (3, minor)).collect();
        candidates.push((2, 7));
        candidates
            .into_iter()
            .filter(|(major, minor)| {
                let version = Version::from_release(vec![*major, *minor]);
                self.0.is_empty()
                    || self.0.iter().any(|c| {
                        c.specifiers.satisfied_by(&version).unwrap_or(false)
                    })
            })
            .collect()
    }
}
