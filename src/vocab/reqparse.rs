use crate::prelude::*;

pub use self::parser::{constraint, marker, versionspec};

peg::parser! {
    grammar parser() for str {
        rule wsp()
            = quiet!{ [' ' | '\t' ] }

        rule letter_or_digit()
            = quiet!{['A'..='Z' | 'a'..='z' | '0'..='9']} / expected!("letter or digit")

        rule _()
            = quiet!{ wsp()* }

        rule version_cmp() -> &'input str
            = $("===" / "<=" / "<" / "!=" / "==" / ">=" / ">" / "~=")

        rule version()
            = (letter_or_digit() / "-" / "_" / "." / "*" / "+" / "!")+

        rule version_one() -> Specifier
            = _ op:version_cmp() _ v:$(version())
            {?
                match CompareOp::try_from(op) {
                    Ok(op) => Ok(Specifier { op, value: v.into() }),
                    Err(_) => Err("comparison operator"),
                }
            }

        rule version_many() -> Specifiers
            = specs:(version_one() ++ (_ ",")) { Specifiers(specs) }

        pub rule versionspec() -> Specifiers
            = ("(" vm:version_many() ")" { vm }) / version_many()

        // An interpreter constraint: an optional implementation name followed
        // by an optional specifier set, e.g. "CPython>=3.8,<4" or "==3.9.*".
        // Validating the name is the caller's job.
        pub rule constraint() -> (Option<&'input str>, Specifiers)
            = _ name:$(['A'..='Z' | 'a'..='z']+)?
              specs:(versionspec() / _ "" { Specifiers::any() }) _
              { (name, specs) }

        rule not_in() -> &'static str
            = "not" wsp()+ "in" { "not in" }

        rule marker_op() -> &'input str
            = _ op:(version_cmp() / $("in") / not_in()) { op }

        rule python_str_c() -> &'input str
            = $(quiet! { [' ' | '\t' | 'A'..='Z' | 'a'..='z' | '0'..='9' | '(' | ')'
                 | '.' | '{' | '}' | '-' | '_' | '*' | '#' | ':' | ';' | ','
                 | '/' | '?' | '[' | ']' | '!' | '~' | '`' | '@' | '$' | '%'
                 | '^' | '&' | '=' | '+' | '|' | '<' | '>'] })
              / expected!("printable character")

        // PEP 508 says that we don't have to support backslash escapes, so we
        // don't, until someone finds a package that uses them in the wild.
        rule python_squote_str() -> &'input str
            = "'" s:$((python_str_c() / "\"")*) "'" { s }

        rule python_dquote_str() -> &'input str
            = "\"" s:$((python_str_c() / "'")*) "\"" { s }

        rule python_str() -> marker::Value
            = s:(python_squote_str() / python_dquote_str())
              { marker::Value::Literal(s.into()) }

        rule env_var() -> marker::Value
            = var:$(
                "python_version" / "python_full_version" / "os_name"
                / "sys_platform" / "platform_release" / "platform_system"
                / "platform_version" / "platform_machine"
                / "platform_python_implementation" / "implementation_name"
                / "implementation_version"
              )
              { marker::Value::Variable(var.to_owned()) }

        rule marker_var() -> marker::Value
            = _ v:(env_var() / python_str()) { v }

        rule marker_expr() -> marker::Expr
            = _ "(" m:marker_or() _ ")" { m }
              / lhs:marker_var() op:marker_op() rhs:marker_var()
              {
                  use marker::Expr::Operator;
                  use marker::Op::*;
                  use CompareOp::*;
                  match op {
                      "<=" => Operator { op: Compare(LessThanEqual), lhs, rhs },
                      "<" => Operator { op: Compare(StrictlyLessThan), lhs, rhs },
                      "!=" => Operator { op: Compare(NotEqual), lhs, rhs },
                      "==" => Operator { op: Compare(Equal), lhs, rhs },
                      "===" => Operator { op: Compare(ArbitraryEqual), lhs, rhs },
                      ">=" => Operator { op: Compare(GreaterThanEqual), lhs, rhs },
                      ">" => Operator { op: Compare(StrictlyGreaterThan), lhs, rhs },
                      "~=" => Operator { op: Compare(Compatible), lhs, rhs },
                      "in" => Operator { op: In, lhs, rhs },
                      "not in" => Operator { op: NotIn, lhs, rhs },
                      _ => panic!("op can't be {:?}!", op),
                  }
              }

        rule marker_and() -> marker::Expr
            = lhs:marker_expr() _ "and" _ rhs:marker_and()
                 { marker::Expr::And(Box::new(lhs), Box::new(rhs)) }
              / marker_expr()

        rule marker_or() -> marker::Expr
            = lhs:marker_and() _ "or" _ rhs:marker_or()
                 { marker::Expr::Or(Box::new(lhs), Box::new(rhs)) }
              / marker_and()

        pub rule marker() -> marker::Expr
            = m:marker_or() _ { m }
    }
}
