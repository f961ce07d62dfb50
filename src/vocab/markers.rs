use crate::prelude::*;

/// The PEP 508 marker variables, as recorded by the interpreter probe. This
/// is a plain value type; unknown variables simply don't exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerEnvironment {
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub sys_platform: String,
    #[serde(default)]
    pub platform_machine: String,
    #[serde(default)]
    pub platform_python_implementation: String,
    #[serde(default)]
    pub platform_release: String,
    #[serde(default)]
    pub platform_system: String,
    #[serde(default)]
    pub platform_version: String,
    #[serde(default)]
    pub python_version: String,
    #[serde(default)]
    pub python_full_version: String,
    #[serde(default)]
    pub implementation_name: String,
    #[serde(default)]
    pub implementation_version: String,
}

impl MarkerEnvironment {
    pub fn get(&self, var: &str) -> Option<&str> {
        Some(match var {
            "os_name" => &self.os_name,
            "sys_platform" => &self.sys_platform,
            "platform_machine" => &self.platform_machine,
            "platform_python_implementation" => &self.platform_python_implementation,
            "platform_release" => &self.platform_release,
            "platform_system" => &self.platform_system,
            "platform_version" => &self.platform_version,
            "python_version" => &self.python_version,
            "python_full_version" => &self.python_full_version,
            "implementation_name" => &self.implementation_name,
            "implementation_version" => &self.implementation_version,
            _ => return None,
        })
    }
}

pub mod marker {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Value {
        Variable(String),
        Literal(String),
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Op {
        Compare(CompareOp),
        In,
        NotIn,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Expr {
        And(Box<Expr>, Box<Expr>),
        Or(Box<Expr>, Box<Expr>),
        Operator { op: Op, lhs: Value, rhs: Value },
    }

    impl Value {
        pub fn eval<'a>(&'a self, env: &'a MarkerEnvironment) -> Result<&'a str> {
            match self {
                Value::Variable(varname) => env
                    .get(varname)
                    .ok_or_else(|| eyre!("no environment marker named '{}'", varname)),
                Value::Literal(s) => Ok(s),
            }
        }
    }

    impl Expr {
        pub fn parse(input: &str) -> Result<Expr> {
            super::super::reqparse::marker(input)
                .map_err(|e| eyre!("{e}"))
                .wrap_err_with(|| format!("failed to parse marker from {:?}", input))
        }

        pub fn eval(&self, env: &MarkerEnvironment) -> Result<bool> {
            Ok(match self {
                Expr::And(lhs, rhs) => lhs.eval(env)? && rhs.eval(env)?,
                Expr::Or(lhs, rhs) => lhs.eval(env)? || rhs.eval(env)?,
                Expr::Operator { op, lhs, rhs } => {
                    let lhs_val = lhs.eval(env)?;
                    let rhs_val = rhs.eval(env)?;
                    match op {
                        Op::In => rhs_val.contains(lhs_val),
                        Op::NotIn => !rhs_val.contains(lhs_val),
                        Op::Compare(op) => {
                            // If both sides look like versions, compare them as
                            // versions; otherwise fall back to string compare.
                            if let Ok(lhs_ver) = Version::parse(lhs_val) {
                                let as_spec = Specifier {
                                    op: *op,
                                    value: rhs_val.to_owned(),
                                };
                                if let Ok(matched) = as_spec.satisfied_by(&lhs_ver) {
                                    return Ok(matched);
                                }
                            }
                            string_compare(*op, lhs_val, rhs_val)?
                        }
                    }
                }
            })
        }
    }

    fn string_compare(op: CompareOp, lhs: &str, rhs: &str) -> Result<bool> {
        use CompareOp::*;
        Ok(match op {
            Equal => lhs == rhs,
            NotEqual => lhs != rhs,
            ArbitraryEqual => lhs == rhs,
            LessThanEqual => lhs <= rhs,
            StrictlyLessThan => lhs < rhs,
            GreaterThanEqual => lhs >= rhs,
            StrictlyGreaterThan => lhs > rhs,
            Compatible => bail!("~= requires version operands (got {:?} and {:?})", lhs, rhs),
        })
    }
}

#[cfg(test)]
mod test {
    use super::marker::Expr;
    use super::*;

    fn env() -> MarkerEnvironment {
        MarkerEnvironment {
            os_name: "posix".into(),
            sys_platform: "linux".into(),
            platform_machine: "x86_64".into(),
            platform_python_implementation: "CPython".into(),
            platform_system: "Linux".into(),
            python_version: "3.11".into(),
            python_full_version: "3.11.4".into(),
            implementation_name: "cpython".into(),
            implementation_version: "3.11.4".into(),
            ..Default::default()
        }
    }

    fn eval(marker: &str) -> bool {
        Expr::parse(marker).unwrap().eval(&env()).unwrap()
    }

    #[test]
    fn test_marker_version_compares() {
        assert!(eval("python_version >= '3.8'"));
        assert!(!eval("python_version < '3.8'"));
        assert!(eval("python_full_version >= '3.11.2'"));
        // version compare, not string compare: "3.11" < "3.9" as strings
        assert!(eval("python_version > '3.9'"));
    }

    #[test]
    fn test_marker_string_compares() {
        assert!(eval("sys_platform == 'linux'"));
        assert!(eval("os_name != 'nt'"));
        assert!(eval("'inux' in sys_platform"));
        assert!(eval("'win' not in sys_platform"));
    }

    #[test]
    fn test_marker_boolean_structure() {
        assert!(eval("sys_platform == 'linux' and python_version >= '3.8'"));
        assert!(eval("sys_platform == 'win32' or python_version >= '3.8'"));
        assert!(!eval("sys_platform == 'win32' and python_version >= '3.8'"));
        assert!(eval(
            "(sys_platform == 'win32' or os_name == 'posix') and python_version >= '3.8'"
        ));
        // 'and' chains associate
        assert!(eval(
            "os_name == 'posix' and sys_platform == 'linux' and platform_machine == 'x86_64'"
        ));
    }

    #[test]
    fn test_marker_unknown_variable_is_parse_error() {
        assert!(Expr::parse("nonsense_var == 'x'").is_err());
    }
}
