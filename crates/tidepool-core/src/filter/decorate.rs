//! Semantic-type decoration of a parsed filter against a bucket schema.
//!
//! Decoration resolves every leaf attribute to its declared field type,
//! coerces assertion values to typed column values (canonicalising IP and
//! subnet forms), folds case for the case-insensitive rules, expands
//! substring components into a LIKE pattern, and marks leaves that cannot
//! be answered from indexed columns.

use serde_json::Value;

use crate::catalog::BucketDescriptor;
use crate::coerce::coerce_scalar;
use crate::error::{Error, FilterError};
use crate::session::SqlValue;
use crate::types::{internal_field_type, FieldType};

use super::Filter;

/// A filter tree annotated with column types and coerced values.
#[derive(Debug, Clone, PartialEq)]
pub enum Decorated {
    And(Vec<Decorated>),
    Or(Vec<Decorated>),
    Not(Box<Decorated>),
    /// A leaf on an attribute that is not backed by a usable index: either
    /// undeclared, or currently being backfilled.
    Unusable { attr: String },
    Leaf {
        attr: String,
        ftype: FieldType,
        kind: LeafKind,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeafKind {
    Eq { value: SqlValue },
    EqCaseIgnore { value: SqlValue },
    Ge { value: SqlValue },
    Le { value: SqlValue },
    Present,
    Substring {
        pattern: String,
        case_insensitive: bool,
    },
}

/// Decorate a parsed filter against a bucket descriptor.
pub fn decorate(filter: &Filter, bucket: &BucketDescriptor) -> Result<Decorated, Error> {
    let reindexing = bucket.reindexing_fields();

    fn resolve(
        bucket: &BucketDescriptor,
        reindexing: &std::collections::BTreeSet<String>,
        attr: &str,
    ) -> Option<FieldType> {
        if reindexing.contains(attr) {
            return None;
        }
        if let Some(def) = bucket.index.get(attr) {
            return Some(def.field_type);
        }
        internal_field_type(attr)
    }

    fn walk(
        bucket: &BucketDescriptor,
        reindexing: &std::collections::BTreeSet<String>,
        filter: &Filter,
    ) -> Result<Decorated, Error> {
        let unusable = |attr: &str| Decorated::Unusable {
            attr: attr.to_string(),
        };

        match filter {
            Filter::And(subs) => Ok(Decorated::And(
                subs.iter()
                    .map(|f| walk(bucket, reindexing, f))
                    .collect::<Result<_, _>>()?,
            )),
            Filter::Or(subs) => Ok(Decorated::Or(
                subs.iter()
                    .map(|f| walk(bucket, reindexing, f))
                    .collect::<Result<_, _>>()?,
            )),
            Filter::Not(sub) => Ok(Decorated::Not(Box::new(walk(bucket, reindexing, sub)?))),

            Filter::Equality { attr, value } => match resolve(bucket, reindexing, attr) {
                None => Ok(unusable(attr)),
                Some(ftype) => Ok(Decorated::Leaf {
                    attr: attr.clone(),
                    ftype,
                    kind: LeafKind::Eq {
                        value: assertion_value(ftype, value)?,
                    },
                }),
            },
            Filter::Ge { attr, value } => match resolve(bucket, reindexing, attr) {
                None => Ok(unusable(attr)),
                Some(ftype) => Ok(Decorated::Leaf {
                    attr: attr.clone(),
                    ftype,
                    kind: LeafKind::Ge {
                        value: assertion_value(ftype, value)?,
                    },
                }),
            },
            Filter::Le { attr, value } => match resolve(bucket, reindexing, attr) {
                None => Ok(unusable(attr)),
                Some(ftype) => Ok(Decorated::Leaf {
                    attr: attr.clone(),
                    ftype,
                    kind: LeafKind::Le {
                        value: assertion_value(ftype, value)?,
                    },
                }),
            },
            Filter::Present { attr } => match resolve(bucket, reindexing, attr) {
                None => Ok(unusable(attr)),
                Some(ftype) => Ok(Decorated::Leaf {
                    attr: attr.clone(),
                    ftype,
                    kind: LeafKind::Present,
                }),
            },
            Filter::Substring {
                attr,
                initial,
                any,
                final_,
            } => match resolve(bucket, reindexing, attr) {
                None => Ok(unusable(attr)),
                Some(ftype) => {
                    require_string(ftype, attr)?;
                    Ok(Decorated::Leaf {
                        attr: attr.clone(),
                        ftype,
                        kind: LeafKind::Substring {
                            pattern: like_pattern(initial.as_deref(), any, final_.as_deref()),
                            case_insensitive: false,
                        },
                    })
                }
            },
            Filter::Ext { attr, rule, value } => match rule.as_str() {
                "caseIgnoreMatch" => match resolve(bucket, reindexing, attr) {
                    None => Ok(unusable(attr)),
                    Some(ftype) => {
                        require_string(ftype, attr)?;
                        Ok(Decorated::Leaf {
                            attr: attr.clone(),
                            ftype,
                            kind: LeafKind::EqCaseIgnore {
                                value: SqlValue::Text(value.to_lowercase()),
                            },
                        })
                    }
                },
                "caseIgnoreSubstringsMatch" => match resolve(bucket, reindexing, attr) {
                    None => Ok(unusable(attr)),
                    Some(ftype) => {
                        require_string(ftype, attr)?;
                        let lowered = value.to_lowercase();
                        let chunks: Vec<&str> = lowered.split('*').collect();
                        let (initial, any, final_) = split_chunks(&chunks);
                        Ok(Decorated::Leaf {
                            attr: attr.clone(),
                            ftype,
                            kind: LeafKind::Substring {
                                pattern: like_pattern(initial, &any, final_),
                                case_insensitive: true,
                            },
                        })
                    }
                },
                other => Err(FilterError::NotIndexed(format!(
                    "unknown matching rule '{other}' on attribute '{attr}'"
                ))
                .into()),
            },
        }
    }

    walk(bucket, &reindexing, filter)
}

/// Coerce an assertion value to the comparison representation for a field:
/// the element type for array fields (containment and ANY comparisons take
/// a scalar), the field type itself otherwise.
fn assertion_value(ftype: FieldType, raw: &str) -> Result<SqlValue, Error> {
    coerce_scalar(ftype.element(), &Value::String(raw.to_string()))
}

fn require_string(ftype: FieldType, attr: &str) -> Result<(), Error> {
    if ftype != FieldType::String {
        return Err(FilterError::InvalidQuery(format!(
            "substring match on non-string attribute '{attr}'"
        ))
        .into());
    }
    Ok(())
}

/// Split star-separated chunks into (initial, any, final) components,
/// dropping empty chunks.
fn split_chunks<'a>(chunks: &[&'a str]) -> (Option<&'a str>, Vec<String>, Option<&'a str>) {
    if chunks.len() < 2 {
        return (chunks.first().copied().filter(|c| !c.is_empty()), Vec::new(), None);
    }
    let initial = Some(chunks[0]).filter(|c| !c.is_empty());
    let final_ = Some(chunks[chunks.len() - 1]).filter(|c| !c.is_empty());
    let any = chunks[1..chunks.len() - 1]
        .iter()
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .collect();
    (initial, any, final_)
}

/// Build the LIKE argument from substring components, normalising runs of
/// `%` to a single wildcard.
fn like_pattern(initial: Option<&str>, any: &[String], final_: Option<&str>) -> String {
    let mut raw = String::new();
    if let Some(i) = initial {
        raw.push_str(i);
    }
    raw.push('%');
    for chunk in any {
        raw.push_str(chunk);
        raw.push('%');
    }
    if let Some(f) = final_ {
        raw.push_str(f);
    }

    let mut pattern = String::with_capacity(raw.len());
    let mut prev_wildcard = false;
    for c in raw.chars() {
        if c == '%' {
            if prev_wildcard {
                continue;
            }
            prev_wildcard = true;
        } else {
            prev_wildcard = false;
        }
        pattern.push(c);
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BucketDescriptor;
    use crate::filter::parse;
    use crate::types::{BucketConfig, BucketOptions};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn bucket(index: serde_json::Value) -> BucketDescriptor {
        let config = BucketConfig::from_value(json!({ "index": index })).unwrap();
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

    fn decorated(bucket: &BucketDescriptor, input: &str) -> Decorated {
        decorate(&parse(input).unwrap(), bucket).unwrap()
    }

    #[test]
    fn test_decorate_indexed_equality() {
        let b = bucket(json!({ "age": { "type": "number" } }));
        match decorated(&b, "(age=30)") {
            Decorated::Leaf { attr, ftype, kind } => {
                assert_eq!(attr, "age");
                assert_eq!(ftype, FieldType::Number);
                assert_eq!(
                    kind,
                    LeafKind::Eq {
                        value: SqlValue::Int(30)
                    }
                );
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_unindexed_marks_unusable() {
        let b = bucket(json!({ "age": { "type": "number" } }));
        match decorated(&b, "(name=ann)") {
            Decorated::Unusable { attr } => assert_eq!(attr, "name"),
            other => panic!("expected unusable, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_internal_fields_usable() {
        let b = bucket(json!({}));
        match decorated(&b, "(_key=k1)") {
            Decorated::Leaf { ftype, .. } => assert_eq!(ftype, FieldType::String),
            other => panic!("expected leaf, got {other:?}"),
        }
        match decorated(&b, "(_mtime>=12345)") {
            Decorated::Leaf { ftype, kind, .. } => {
                assert_eq!(ftype, FieldType::Number);
                assert_eq!(
                    kind,
                    LeafKind::Ge {
                        value: SqlValue::Int(12345)
                    }
                );
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_reindexing_field_unusable() {
        let mut b = bucket(json!({ "name": { "type": "string" } }));
        let mut fields = BTreeSet::new();
        fields.insert("name".to_string());
        b.reindex_active.insert(2, fields);

        match decorated(&b, "(name=ann)") {
            Decorated::Unusable { attr } => assert_eq!(attr, "name"),
            other => panic!("expected unusable, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_ip_canonicalises() {
        let b = bucket(json!({ "addr": { "type": "ip" } }));
        match decorated(&b, "(addr<=10.0.0.255)") {
            Decorated::Leaf { kind, .. } => match kind {
                LeafKind::Le {
                    value: SqlValue::Inet(ip),
                } => assert_eq!(ip.address().to_string(), "10.0.0.255"),
                other => panic!("expected inet le, got {other:?}"),
            },
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_ip_garbage_fails() {
        let b = bucket(json!({ "addr": { "type": "ip" } }));
        let err = decorate(&parse("(addr=bogus)").unwrap(), &b).unwrap_err();
        assert!(format!("{err}").contains("not a valid ip"));
    }

    #[test]
    fn test_decorate_array_field_uses_element_type() {
        let b = bucket(json!({ "ports": { "type": "[number]" } }));
        match decorated(&b, "(ports=8080)") {
            Decorated::Leaf { ftype, kind, .. } => {
                assert_eq!(ftype, FieldType::NumberArray);
                assert_eq!(
                    kind,
                    LeafKind::Eq {
                        value: SqlValue::Int(8080)
                    }
                );
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_case_ignore_lowers_value() {
        let b = bucket(json!({ "name": { "type": "string" } }));
        match decorated(&b, "(name:caseIgnoreMatch:=AnN)") {
            Decorated::Leaf { kind, .. } => assert_eq!(
                kind,
                LeafKind::EqCaseIgnore {
                    value: SqlValue::Text("ann".to_string())
                }
            ),
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_case_ignore_substrings() {
        let b = bucket(json!({ "name": { "type": "string" } }));
        match decorated(&b, "(name:caseIgnoreSubstringsMatch:=An*N)") {
            Decorated::Leaf { kind, .. } => assert_eq!(
                kind,
                LeafKind::Substring {
                    pattern: "an%n".to_string(),
                    case_insensitive: true
                }
            ),
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_decorate_unknown_rule_not_indexed() {
        let b = bucket(json!({ "name": { "type": "string" } }));
        let err = decorate(&parse("(name:soundex:=ann)").unwrap(), &b).unwrap_err();
        assert!(matches!(
            err,
            Error::Filter(FilterError::NotIndexed(_))
        ));
    }

    #[test]
    fn test_decorate_substring_non_string_rejected() {
        let b = bucket(json!({ "age": { "type": "number" } }));
        let err = decorate(&parse("(age=1*2)").unwrap(), &b).unwrap_err();
        assert!(matches!(err, Error::Filter(FilterError::InvalidQuery(_))));
    }

    #[test]
    fn test_like_pattern_shapes() {
        assert_eq!(like_pattern(Some("pre"), &[], Some("post")), "pre%post");
        assert_eq!(
            like_pattern(None, &["x".to_string()], None),
            "%x%"
        );
        assert_eq!(
            like_pattern(Some("a"), &["b".to_string(), "c".to_string()], Some("d")),
            "a%b%c%d"
        );
        assert_eq!(like_pattern(Some("ab"), &[], None), "ab%");
    }

    #[test]
    fn test_like_pattern_normalises_double_wildcards() {
        // Components that would butt two % together collapse to one.
        assert_eq!(like_pattern(None, &[], None), "%");
        assert_eq!(
            like_pattern(None, &["a".to_string()], None),
            "%a%"
        );
    }
}
