//! Compilation of a decorated filter to a parameterised SQL boolean
//! expression.
//!
//! Placeholders are 1-based and dense: the compiler threads a running
//! argument list, so nested compilations never skip or reuse a position.
//! Leaves on unusable attributes compile to nothing; a conjunction keeps
//! whatever survives, while disjunctions, negations, and the top level
//! require every branch to compile.

use crate::error::{Error, FilterError};
use crate::session::SqlValue;
use crate::types::FieldType;

use super::decorate::{Decorated, LeafKind};

/// A compiled WHERE expression with its ordered parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub clause: String,
    pub args: Vec<SqlValue>,
}

/// Compile a decorated filter, with placeholders starting at `$1`.
pub fn compile(filter: &Decorated) -> Result<CompiledFilter, Error> {
    compile_from(filter, 0)
}

/// Compile a decorated filter with the placeholder counter starting after
/// `offset` already-bound parameters. Used when the clause is appended to
/// a statement that binds its own leading arguments.
pub fn compile_from(filter: &Decorated, offset: usize) -> Result<CompiledFilter, Error> {
    let mut args = Vec::new();
    let clause = walk(filter, offset, &mut args)?.ok_or_else(|| {
        Error::from(FilterError::NotIndexed(
            "filter has no indexed predicates".to_string(),
        ))
    })?;
    Ok(CompiledFilter { clause, args })
}

fn walk(
    filter: &Decorated,
    offset: usize,
    args: &mut Vec<SqlValue>,
) -> Result<Option<String>, Error> {
    match filter {
        Decorated::Unusable { .. } => Ok(None),

        Decorated::Leaf { attr, ftype, kind } => {
            Ok(Some(compile_leaf(attr, *ftype, kind, offset, args)))
        }

        Decorated::And(subs) => {
            let mut clauses = Vec::with_capacity(subs.len());
            for sub in subs {
                if let Some(clause) = walk(sub, offset, args)? {
                    clauses.push(clause);
                }
            }
            if clauses.is_empty() {
                return Err(FilterError::NotIndexed(
                    "no indexed predicates under conjunction".to_string(),
                )
                .into());
            }
            Ok(Some(format!("({})", clauses.join(" AND "))))
        }

        Decorated::Or(subs) => {
            let mut clauses = Vec::with_capacity(subs.len());
            for sub in subs {
                match walk(sub, offset, args)? {
                    Some(clause) => clauses.push(clause),
                    None => {
                        return Err(FilterError::NotIndexed(
                            "unindexed predicate under disjunction".to_string(),
                        )
                        .into());
                    }
                }
            }
            Ok(Some(format!("({})", clauses.join(" OR "))))
        }

        Decorated::Not(sub) => match walk(sub, offset, args)? {
            Some(clause) => Ok(Some(format!("NOT ({clause})"))),
            None => Err(FilterError::NotIndexed(
                "unindexed predicate under negation".to_string(),
            )
            .into()),
        },
    }
}

fn compile_leaf(
    attr: &str,
    ftype: FieldType,
    kind: &LeafKind,
    offset: usize,
    args: &mut Vec<SqlValue>,
) -> String {
    let mut bind = |value: &SqlValue| {
        args.push(value.clone());
        offset + args.len()
    };

    match kind {
        LeafKind::Eq { value } => {
            if ftype.is_array() {
                let n = bind(value);
                format!("{attr} @> ARRAY[${n}]::{}", ftype.pg_type())
            } else {
                let n = bind(value);
                format!("({attr} = ${n} AND {attr} IS NOT NULL)")
            }
        }
        LeafKind::EqCaseIgnore { value } => {
            let n = bind(value);
            format!("(LOWER({attr}) = ${n} AND {attr} IS NOT NULL)")
        }
        LeafKind::Ge { value } => {
            if ftype.is_array() {
                let n = bind(value);
                format!("${n} <= ANY({attr})")
            } else {
                let n = bind(value);
                format!("({attr} >= ${n} AND {attr} IS NOT NULL)")
            }
        }
        LeafKind::Le { value } => {
            if ftype.is_array() {
                let n = bind(value);
                format!("${n} >= ANY({attr})")
            } else {
                let n = bind(value);
                format!("({attr} <= ${n} AND {attr} IS NOT NULL)")
            }
        }
        LeafKind::Present => format!("({attr} IS NOT NULL)"),
        LeafKind::Substring {
            pattern,
            case_insensitive,
        } => {
            let n = bind(&SqlValue::Text(pattern.clone()));
            let op = if *case_insensitive { "ILIKE" } else { "LIKE" };
            format!("({attr} {op} ${n} AND {attr} IS NOT NULL)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BucketDescriptor;
    use crate::filter::decorate::decorate;
    use crate::filter::parse;
    use crate::types::{BucketConfig, BucketOptions};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn bucket() -> BucketDescriptor {
        let config = BucketConfig::from_value(json!({ "index": {
            "age": { "type": "number" },
            "name": { "type": "string" },
            "active": { "type": "boolean" },
            "addr": { "type": "ip" },
            "net": { "type": "subnet" },
            "tags": { "type": "[string]" },
            "ports": { "type": "[number]" }
        }}))
        .unwrap();
        BucketDescriptor {
            name: "people".to_string(),
            index: config.index,
            pre: vec![],
            post: vec![],
            options: BucketOptions { version: 1 },
            reindex_active: BTreeMap::new(),
            mtime: Utc::now(),
            pre_triggers: vec![],
            post_triggers: vec![],
        }
    }

    fn compiled(input: &str) -> CompiledFilter {
        compile(&decorate(&parse(input).unwrap(), &bucket()).unwrap()).unwrap()
    }

    fn compile_err(input: &str) -> Error {
        compile(&decorate(&parse(input).unwrap(), &bucket()).unwrap()).unwrap_err()
    }

    #[test]
    fn test_compile_equality() {
        let c = compiled("(age=30)");
        assert_eq!(c.clause, "(age = $1 AND age IS NOT NULL)");
        assert_eq!(c.args, vec![SqlValue::Int(30)]);
    }

    #[test]
    fn test_compile_ge_le() {
        let c = compiled("(age>=18)");
        assert_eq!(c.clause, "(age >= $1 AND age IS NOT NULL)");

        let c = compiled("(age<=65)");
        assert_eq!(c.clause, "(age <= $1 AND age IS NOT NULL)");
    }

    #[test]
    fn test_compile_present() {
        let c = compiled("(name=*)");
        assert_eq!(c.clause, "(name IS NOT NULL)");
        assert!(c.args.is_empty());
    }

    #[test]
    fn test_compile_substring() {
        let c = compiled("(name=an*)");
        assert_eq!(c.clause, "(name LIKE $1 AND name IS NOT NULL)");
        assert_eq!(c.args, vec![SqlValue::Text("an%".to_string())]);

        let c = compiled("(name=*x*)");
        assert_eq!(c.args, vec![SqlValue::Text("%x%".to_string())]);
    }

    #[test]
    fn test_compile_case_insensitive_substring() {
        let c = compiled("(name:caseIgnoreSubstringsMatch:=An*)");
        assert_eq!(c.clause, "(name ILIKE $1 AND name IS NOT NULL)");
        assert_eq!(c.args, vec![SqlValue::Text("an%".to_string())]);
    }

    #[test]
    fn test_compile_case_insensitive_equality() {
        let c = compiled("(name:caseIgnoreMatch:=AnN)");
        assert_eq!(c.clause, "(LOWER(name) = $1 AND name IS NOT NULL)");
        assert_eq!(c.args, vec![SqlValue::Text("ann".to_string())]);
    }

    #[test]
    fn test_compile_array_containment() {
        let c = compiled("(tags=admin)");
        assert_eq!(c.clause, "tags @> ARRAY[$1]::TEXT[]");
        assert_eq!(c.args, vec![SqlValue::Text("admin".to_string())]);
    }

    #[test]
    fn test_compile_array_range_flips_operator() {
        // (ports>=8000) holds when some element is >= 8000.
        let c = compiled("(ports>=8000)");
        assert_eq!(c.clause, "$1 <= ANY(ports)");

        let c = compiled("(ports<=1024)");
        assert_eq!(c.clause, "$1 >= ANY(ports)");
    }

    #[test]
    fn test_compile_and_placeholders_dense() {
        let c = compiled("(&(age>=18)(name=ann)(active=true))");
        assert_eq!(
            c.clause,
            "((age >= $1 AND age IS NOT NULL) AND (name = $2 AND name IS NOT NULL) \
             AND (active = $3 AND active IS NOT NULL))"
        );
        assert_eq!(
            c.args,
            vec![
                SqlValue::Int(18),
                SqlValue::Text("ann".to_string()),
                SqlValue::Bool(true)
            ]
        );
    }

    #[test]
    fn test_compile_or_and_not() {
        let c = compiled("(|(age=1)(age=2))");
        assert_eq!(
            c.clause,
            "((age = $1 AND age IS NOT NULL) OR (age = $2 AND age IS NOT NULL))"
        );

        let c = compiled("(!(age=1))");
        assert_eq!(c.clause, "NOT ((age = $1 AND age IS NOT NULL))");
    }

    #[test]
    fn test_compile_nested_counter_threading() {
        let c = compiled("(&(|(age=1)(age=2))(name=ann))");
        assert_eq!(
            c.clause,
            "(((age = $1 AND age IS NOT NULL) OR (age = $2 AND age IS NOT NULL)) \
             AND (name = $3 AND name IS NOT NULL))"
        );
        assert_eq!(c.args.len(), 3);
    }

    #[test]
    fn test_compile_with_offset() {
        let decorated = decorate(&parse("(age=30)").unwrap(), &bucket()).unwrap();
        let c = compile_from(&decorated, 4).unwrap();
        assert_eq!(c.clause, "(age = $5 AND age IS NOT NULL)");
        assert_eq!(c.args.len(), 1);
    }

    #[test]
    fn test_unindexed_top_level_fails() {
        let err = compile_err("(missing=1)");
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));

        // Presence on an unindexed attribute is equally rejected.
        let err = compile_err("(missing=*)");
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));
    }

    #[test]
    fn test_and_drops_unindexed_legs() {
        let c = compiled("(&(missing=1)(age=30))");
        assert_eq!(c.clause, "((age = $1 AND age IS NOT NULL))");
        assert_eq!(c.args, vec![SqlValue::Int(30)]);
    }

    #[test]
    fn test_and_all_unindexed_fails() {
        let err = compile_err("(&(missing=1)(other=2))");
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));
    }

    #[test]
    fn test_or_requires_every_leg() {
        let err = compile_err("(|(age=30)(missing=1))");
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));
    }

    #[test]
    fn test_not_requires_child() {
        let err = compile_err("(!(missing=1))");
        assert!(matches!(err, Error::Filter(FilterError::NotIndexed(_))));
    }

    #[test]
    fn test_compile_inet_argument() {
        let c = compiled("(addr<=10.0.0.255)");
        assert_eq!(c.clause, "(addr <= $1 AND addr IS NOT NULL)");
        match &c.args[0] {
            SqlValue::Inet(ip) => assert_eq!(ip.address().to_string(), "10.0.0.255"),
            other => panic!("expected inet arg, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_subnet_argument() {
        let c = compiled("(net=192.168.0.0/16)");
        assert_eq!(c.clause, "(net = $1 AND net IS NOT NULL)");
        match &c.args[0] {
            SqlValue::Cidr(net) => assert_eq!(net.to_string(), "192.168.0.0/16"),
            other => panic!("expected cidr arg, got {other:?}"),
        }
    }

    #[test]
    fn test_compile_internal_field() {
        let c = compiled("(_key=k1)");
        assert_eq!(c.clause, "(_key = $1 AND _key IS NOT NULL)");
    }
}
