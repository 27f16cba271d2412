//! Ops-file patch engine
//!
//! Paths are `/`-separated tokens:
//! - `key` selects a map entry, `key?` creates it when absent
//! - `3` selects an array element, negative indexes count from the end
//! - `-` addresses the position after the last array element
//! - `name=value` selects the single array element whose `name` is `value`,
//!   `name=value?` creates `{name: value}` when absent
//!
//! `~1` and `~0` escape `/` and `~` inside tokens. Operations run on a copy
//! of the document, so a failing batch leaves the input untouched.

use serde_json::{Map, Value};

use crate::{ManifestError, Result};

/// Kind of patch operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Overwrite an existing value
    Replace,
    /// Delete an existing value
    Remove,
    /// Set a value, creating intermediate containers
    Add,
}

/// One patch operation
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    pub kind: OpKind,
    pub path: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Key { key: String, optional: bool },
    Index(i64),
    AfterLast,
    Match {
        key: String,
        value: String,
        optional: bool,
    },
}

impl Token {
    fn parse(raw: &str) -> Self {
        let raw = raw.replace("~1", "/").replace("~0", "~");
        if raw == "-" {
            return Self::AfterLast;
        }
        if let Ok(index) = raw.parse::<i64>() {
            return Self::Index(index);
        }
        let (body, optional) = match raw.strip_suffix('?') {
            Some(body) => (body.to_string(), true),
            None => (raw, false),
        };
        match body.split_once('=') {
            Some((key, value)) => Self::Match {
                key: key.to_string(),
                value: value.to_string(),
                optional,
            },
            None => Self::Key {
                key: body,
                optional,
            },
        }
    }

    fn is_optional(&self) -> bool {
        matches!(
            self,
            Self::Key { optional: true, .. } | Self::Match { optional: true, .. }
        )
    }

    /// Empty container fitting what this token addresses
    fn empty_container(&self) -> Value {
        match self {
            Self::Key { .. } => Value::Object(Map::new()),
            _ => Value::Array(Vec::new()),
        }
    }
}

fn parse_path(path: &str) -> std::result::Result<Vec<Token>, String> {
    if path.is_empty() || path == "/" {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| "path must start with '/'".to_string())?;
    Ok(rest.split('/').map(Token::parse).collect())
}

fn value_as_match_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn resolve_index(index: i64, len: usize, allow_end: bool) -> std::result::Result<usize, String> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    let upper = if allow_end { len as i64 } else { len as i64 - 1 };
    if resolved < 0 || resolved > upper {
        return Err(format!("index {index} out of bounds for array of length {len}"));
    }
    Ok(resolved as usize)
}

fn find_matches(items: &[Value], key: &str, value: &str) -> Vec<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            item.get(key)
                .and_then(value_as_match_string)
                .is_some_and(|v| v == value)
        })
        .map(|(i, _)| i)
        .collect()
}

fn single_match(
    items: &[Value],
    key: &str,
    value: &str,
) -> std::result::Result<Option<usize>, String> {
    let found = find_matches(items, key, value);
    match found.as_slice() {
        [] => Ok(None),
        [i] => Ok(Some(*i)),
        _ => Err(format!(
            "expected one element matching '{key}={value}', found {}",
            found.len()
        )),
    }
}

/// Walk to the container addressed by `tokens`
///
/// Missing entries are created when `create` is set or once an optional
/// token was passed; the following token decides the kind of container.
fn descend<'a>(
    mut current: &'a mut Value,
    tokens: &[Token],
    create: bool,
) -> std::result::Result<&'a mut Value, String> {
    let mut optional = false;
    for (pos, token) in tokens.iter().enumerate() {
        let next = tokens.get(pos + 1);
        optional |= token.is_optional();
        let may_create = create || optional;
        let fresh = || next.map(Token::empty_container).unwrap_or(Value::Null);
        current = match token {
            Token::Key { key, .. } => {
                let map = current
                    .as_object_mut()
                    .ok_or_else(|| format!("expected a map at '{key}'"))?;
                if !map.contains_key(key) {
                    if !may_create {
                        return Err(format!("key '{key}' not found"));
                    }
                    map.insert(key.clone(), fresh());
                }
                map.get_mut(key)
                    .ok_or_else(|| format!("key '{key}' not found"))?
            }
            Token::Index(index) => {
                let items = current
                    .as_array_mut()
                    .ok_or_else(|| format!("expected an array at index {index}"))?;
                let i = resolve_index(*index, items.len(), false)?;
                &mut items[i]
            }
            Token::AfterLast => {
                if !create {
                    return Err("'-' only addresses a new element".to_string());
                }
                let items = current
                    .as_array_mut()
                    .ok_or_else(|| "expected an array at '-'".to_string())?;
                items.push(fresh());
                let last = items.len() - 1;
                &mut items[last]
            }
            Token::Match { key, value, .. } => {
                let items = current
                    .as_array_mut()
                    .ok_or_else(|| format!("expected an array at '{key}={value}'"))?;
                let i = match single_match(items, key, value)? {
                    Some(i) => i,
                    None if may_create => {
                        let mut entry = Map::new();
                        entry.insert(key.clone(), Value::String(value.clone()));
                        items.push(Value::Object(entry));
                        items.len() - 1
                    }
                    None => return Err(format!("no element matching '{key}={value}'")),
                };
                &mut items[i]
            }
        };
    }
    Ok(current)
}

fn apply_op(doc: &mut Value, op: &Op) -> std::result::Result<(), String> {
    let tokens = parse_path(&op.path)?;
    let Some((last, parents)) = tokens.split_last() else {
        return match op.kind {
            OpKind::Remove => Err("cannot remove the document root".to_string()),
            OpKind::Replace | OpKind::Add => {
                *doc = op.value.clone();
                Ok(())
            }
        };
    };

    let parent = descend(doc, parents, op.kind == OpKind::Add)?;
    let optional = last.is_optional() || parents.iter().any(Token::is_optional);

    match (op.kind, last) {
        (kind, Token::Key { key, .. }) => {
            let map = parent
                .as_object_mut()
                .ok_or_else(|| format!("expected a map at '{key}'"))?;
            match kind {
                OpKind::Replace if !map.contains_key(key) && !optional => {
                    Err(format!("key '{key}' not found"))
                }
                OpKind::Replace | OpKind::Add => {
                    map.insert(key.clone(), op.value.clone());
                    Ok(())
                }
                OpKind::Remove => match map.remove(key) {
                    Some(_) => Ok(()),
                    None if optional => Ok(()),
                    None => Err(format!("key '{key}' not found")),
                },
            }
        }
        (kind, Token::Index(index)) => {
            let items = parent
                .as_array_mut()
                .ok_or_else(|| format!("expected an array at index {index}"))?;
            match kind {
                OpKind::Replace => {
                    let i = resolve_index(*index, items.len(), false)?;
                    items[i] = op.value.clone();
                }
                OpKind::Remove => {
                    let i = resolve_index(*index, items.len(), false)?;
                    items.remove(i);
                }
                OpKind::Add => {
                    let i = resolve_index(*index, items.len(), true)?;
                    items.insert(i, op.value.clone());
                }
            }
            Ok(())
        }
        (OpKind::Remove, Token::AfterLast) => Err("'-' cannot be removed".to_string()),
        (_, Token::AfterLast) => {
            parent
                .as_array_mut()
                .ok_or_else(|| "expected an array at '-'".to_string())?
                .push(op.value.clone());
            Ok(())
        }
        (kind, Token::Match { key, value, .. }) => {
            let items = parent
                .as_array_mut()
                .ok_or_else(|| format!("expected an array at '{key}={value}'"))?;
            match (kind, single_match(items, key, value)?) {
                (OpKind::Remove, Some(i)) => {
                    items.remove(i);
                    Ok(())
                }
                (OpKind::Remove, None) if optional => Ok(()),
                (OpKind::Replace | OpKind::Add, Some(i)) => {
                    items[i] = op.value.clone();
                    Ok(())
                }
                (OpKind::Add, None) => {
                    items.push(op.value.clone());
                    Ok(())
                }
                (OpKind::Replace, None) if optional => {
                    items.push(op.value.clone());
                    Ok(())
                }
                (_, None) => Err(format!("no element matching '{key}={value}'")),
            }
        }
    }
}

/// Apply `ops` in order to a copy of `document`
pub fn apply(document: &Value, ops: &[Op]) -> Result<Value> {
    let mut doc = document.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_op(&mut doc, op).map_err(|message| ManifestError::patch(index, &op.path, message))?;
    }
    Ok(doc)
}

/// Parse the operations of an ops document
///
/// An empty document holds no operations.
pub fn parse_ops(document: &Value) -> Result<Vec<Op>> {
    let items = match document {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        _ => return Err(ManifestError::schema("ops file must be a list of operations")),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let path = item
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| ManifestError::patch(index, "", "missing path"))?
                .to_string();
            let kind = match item.get("type").and_then(Value::as_str) {
                Some("replace") => OpKind::Replace,
                Some("remove") => OpKind::Remove,
                Some("add") => OpKind::Add,
                Some(other) => {
                    return Err(ManifestError::patch(
                        index,
                        path,
                        format!("unsupported op type '{other}'"),
                    ))
                }
                None => return Err(ManifestError::patch(index, path, "missing type")),
            };
            let value = match (kind, item.get("value")) {
                (OpKind::Remove, _) => Value::Null,
                (_, Some(value)) => value.clone(),
                (_, None) => return Err(ManifestError::patch(index, path, "missing value")),
            };
            Ok(Op { kind, path, value })
        })
        .collect()
}
