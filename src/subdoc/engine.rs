//! The sub-document operation engine (spec C4). Spec treats this as an
//! external black box; this module defines the trait it's consumed through
//! (`SubdocEngine`) and ships one concrete implementation (`JsonPathEngine`)
//! built on `serde_json`, so the crate is runnable end-to-end.

use serde_json::Value;

use super::path::{Path, PathComponent};

pub const MAX_DOC_DEPTH: usize = 32;

/// Abstract sub-document command, independent of wire opcode (spec §3
/// "Operation traits": `subdoc_cmd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdocCommand {
    Get,
    Exists,
    GetCount,
    DictAdd,
    DictUpsert,
    Delete,
    Replace,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Counter,
}

impl SubdocCommand {
    pub fn is_mutator(self) -> bool {
        !matches!(self, SubdocCommand::Get | SubdocCommand::Exists | SubdocCommand::GetCount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdocEngineError {
    PathEnoent,
    PathMismatch,
    DocEtoodeep,
    PathEinval,
    DocEexists,
    PathE2big,
    NumE2big,
    DeltaE2big,
    ValueCantinsert,
    ValueEtoodeep,
}

pub type SubdocResult<T> = Result<T, SubdocEngineError>;

/// Result of a successful read-only operation: the matched JSON, serialized
/// to its canonical bytes. Spec describes this as a `(pointer, length)` into
/// the input buffer for a true zero-copy engine; this concrete engine
/// operates on a parsed `serde_json::Value` and returns an owned copy
/// instead (documented deviation, see DESIGN.md).
#[derive(Debug, Clone)]
pub struct MatchLocation {
    pub bytes: Vec<u8>,
}

/// One fragment of a mutator's new document. A zero-copy engine could yield
/// several fragments aliasing the input buffer, the request value, or
/// engine scratch; this engine always yields the whole new document as a
/// single owned fragment, which is a valid degenerate case of the contract.
#[derive(Debug, Clone)]
pub enum DocFragment {
    Owned(Vec<u8>),
}

impl DocFragment {
    pub fn len(&self) -> usize {
        match self {
            DocFragment::Owned(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            DocFragment::Owned(v) => v,
        }
    }
}

pub enum MutateOutcome {
    /// The mutation produced a new document (fragments concatenate to it),
    /// and the path's resulting value, if the caller wants it echoed back
    /// (e.g. COUNTER returns the post-increment number).
    Applied {
        fragments: Vec<DocFragment>,
        echo: Option<MatchLocation>,
    },
}

/// The contract consumed by the executor (C5) and multi-path coordinator
/// (C6): apply one JSON path operation to a document buffer.
pub trait SubdocEngine: Send + Sync {
    fn lookup(
        &self,
        cmd: SubdocCommand,
        document: &[u8],
        path: &Path,
    ) -> SubdocResult<MatchLocation>;

    fn mutate(
        &self,
        cmd: SubdocCommand,
        document: &[u8],
        path: &Path,
        value: &[u8],
        mkdir_p: bool,
        counter_delta: Option<i64>,
    ) -> SubdocResult<MutateOutcome>;
}

/// Reference implementation over `serde_json::Value`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonPathEngine;

impl JsonPathEngine {
    fn parse_document(document: &[u8]) -> SubdocResult<Value> {
        serde_json::from_slice(document).map_err(|_| SubdocEngineError::PathMismatch)
    }

    fn navigate<'a>(root: &'a Value, components: &[PathComponent]) -> SubdocResult<&'a Value> {
        let mut cur = root;
        for (depth, comp) in components.iter().enumerate() {
            if depth >= MAX_DOC_DEPTH {
                return Err(SubdocEngineError::DocEtoodeep);
            }
            cur = match (cur, comp) {
                (Value::Object(map), PathComponent::Key(k)) => {
                    map.get(k).ok_or(SubdocEngineError::PathEnoent)?
                }
                (Value::Array(arr), PathComponent::Index(idx)) => {
                    resolve_index(arr.len(), *idx)
                        .and_then(|i| arr.get(i))
                        .ok_or(SubdocEngineError::PathEnoent)?
                }
                _ => return Err(SubdocEngineError::PathMismatch),
            };
        }
        Ok(cur)
    }

    /// Navigate to the parent of the final path component, creating missing
    /// intermediate objects along the way when `mkdir_p` is set. Returns the
    /// parent and the final component.
    fn navigate_parent_mut<'a>(
        root: &'a mut Value,
        components: &[PathComponent],
        mkdir_p: bool,
    ) -> SubdocResult<(&'a mut Value, PathComponent)> {
        if components.is_empty() {
            return Err(SubdocEngineError::PathEinval);
        }
        let (last, init) = components.split_last().unwrap();
        let mut cur = root;
        for (depth, comp) in init.iter().enumerate() {
            if depth >= MAX_DOC_DEPTH {
                return Err(SubdocEngineError::DocEtoodeep);
            }
            cur = match comp {
                PathComponent::Key(k) => {
                    if !cur.is_object() {
                        return Err(SubdocEngineError::PathMismatch);
                    }
                    let map = cur.as_object_mut().unwrap();
                    if !map.contains_key(k) {
                        if mkdir_p {
                            map.insert(k.clone(), Value::Object(Default::default()));
                        } else {
                            return Err(SubdocEngineError::PathEnoent);
                        }
                    }
                    map.get_mut(k).unwrap()
                }
                PathComponent::Index(idx) => {
                    if !cur.is_array() {
                        return Err(SubdocEngineError::PathMismatch);
                    }
                    let len = cur.as_array().unwrap().len();
                    let i = resolve_index(len, *idx).ok_or(SubdocEngineError::PathEnoent)?;
                    cur.as_array_mut().unwrap().get_mut(i).unwrap()
                }
            };
        }
        Ok((cur, last.clone()))
    }

    fn serialize(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).expect("Value serialization cannot fail")
    }
}

fn resolve_index(len: usize, idx: i64) -> Option<usize> {
    if idx >= 0 {
        let i = idx as usize;
        if i < len { Some(i) } else { None }
    } else {
        let from_end = (-idx) as usize;
        if from_end <= len { Some(len - from_end) } else { None }
    }
}

impl SubdocEngine for JsonPathEngine {
    fn lookup(
        &self,
        cmd: SubdocCommand,
        document: &[u8],
        path: &Path,
    ) -> SubdocResult<MatchLocation> {
        let root = Self::parse_document(document)?;
        match cmd {
            SubdocCommand::Exists => {
                Self::navigate(&root, &path.components)?;
                Ok(MatchLocation { bytes: Vec::new() })
            }
            SubdocCommand::Get => {
                let found = Self::navigate(&root, &path.components)?;
                Ok(MatchLocation {
                    bytes: Self::serialize(found),
                })
            }
            SubdocCommand::GetCount => {
                let found = if path.is_empty() {
                    &root
                } else {
                    Self::navigate(&root, &path.components)?
                };
                let count = match found {
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => return Err(SubdocEngineError::PathMismatch),
                };
                Ok(MatchLocation {
                    bytes: count.to_string().into_bytes(),
                })
            }
            _ => unreachable!("non-lookup command routed to lookup()"),
        }
    }

    fn mutate(
        &self,
        cmd: SubdocCommand,
        document: &[u8],
        path: &Path,
        value: &[u8],
        mkdir_p: bool,
        counter_delta: Option<i64>,
    ) -> SubdocResult<MutateOutcome> {
        let mut root = Self::parse_document(document)?;

        // COUNTER's "value" is the textual delta the executor already parsed
        // into `counter_delta` (e.g. "+3"), not JSON — `serde_json` rejects a
        // leading '+' on a number, so it must never reach `from_slice` here.
        let parsed_value: Option<Value> = if cmd == SubdocCommand::Counter || value.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(value).map_err(|_| SubdocEngineError::ValueCantinsert)?)
        };

        let echo = match cmd {
            SubdocCommand::DictAdd | SubdocCommand::DictUpsert => {
                let is_add = cmd == SubdocCommand::DictAdd;
                let (parent, last) = Self::navigate_parent_mut(&mut root, &path.components, mkdir_p)?;
                let key = match last {
                    PathComponent::Key(k) => k,
                    PathComponent::Index(_) => return Err(SubdocEngineError::PathMismatch),
                };
                let map = parent.as_object_mut().ok_or(SubdocEngineError::PathMismatch)?;
                if is_add && map.contains_key(&key) {
                    return Err(SubdocEngineError::DocEexists);
                }
                map.insert(key, parsed_value.ok_or(SubdocEngineError::ValueCantinsert)?);
                None
            }
            SubdocCommand::Replace => {
                let (parent, last) = Self::navigate_parent_mut(&mut root, &path.components, false)?;
                set_existing_component(parent, &last, parsed_value.ok_or(SubdocEngineError::ValueCantinsert)?)?;
                None
            }
            SubdocCommand::Delete => {
                let (parent, last) = Self::navigate_parent_mut(&mut root, &path.components, false)?;
                remove_existing_component(parent, &last)?;
                None
            }
            SubdocCommand::ArrayPushLast | SubdocCommand::ArrayPushFirst => {
                let push_last = cmd == SubdocCommand::ArrayPushLast;
                let arr = array_target(&mut root, path, mkdir_p)?;
                let v = parsed_value.ok_or(SubdocEngineError::ValueCantinsert)?;
                if push_last {
                    arr.push(v);
                } else {
                    arr.insert(0, v);
                }
                None
            }
            SubdocCommand::ArrayInsert => {
                let (parent, last) = Self::navigate_parent_mut(&mut root, &path.components, false)?;
                let idx = match last {
                    PathComponent::Index(i) => i,
                    PathComponent::Key(_) => return Err(SubdocEngineError::PathMismatch),
                };
                let arr = parent.as_array_mut().ok_or(SubdocEngineError::PathMismatch)?;
                let pos = resolve_index(arr.len() + 1, idx).ok_or(SubdocEngineError::PathEnoent)?;
                arr.insert(pos, parsed_value.ok_or(SubdocEngineError::ValueCantinsert)?);
                None
            }
            SubdocCommand::ArrayAddUnique => {
                let arr = array_target(&mut root, path, mkdir_p)?;
                let v = parsed_value.ok_or(SubdocEngineError::ValueCantinsert)?;
                if !v.is_string() && !v.is_number() && !v.is_boolean() && !v.is_null() {
                    return Err(SubdocEngineError::ValueCantinsert);
                }
                if arr.iter().any(|existing| existing == &v) {
                    return Err(SubdocEngineError::DocEexists);
                }
                arr.push(v);
                None
            }
            SubdocCommand::Counter => {
                let delta = counter_delta.ok_or(SubdocEngineError::DeltaE2big)?;
                if delta == 0 {
                    return Err(SubdocEngineError::DeltaE2big);
                }
                let (parent, last) = Self::navigate_parent_mut(&mut root, &path.components, mkdir_p)?;
                let new_val = apply_counter(parent, &last, delta, mkdir_p)?;
                Some(MatchLocation {
                    bytes: new_val.to_string().into_bytes(),
                })
            }
            SubdocCommand::Get | SubdocCommand::Exists | SubdocCommand::GetCount => {
                unreachable!("non-mutator command routed to mutate()")
            }
        };

        Ok(MutateOutcome::Applied {
            fragments: vec![DocFragment::Owned(Self::serialize(&root))],
            echo,
        })
    }
}

fn array_target<'a>(
    root: &'a mut Value,
    path: &Path,
    mkdir_p: bool,
) -> SubdocResult<&'a mut Vec<Value>> {
    if path.is_empty() {
        return root.as_array_mut().ok_or(SubdocEngineError::PathMismatch);
    }
    let (last, init) = path.components.split_last().unwrap();
    let parent_path = Path {
        components: init.to_vec(),
    };
    let (parent, last) = if parent_path.is_empty() {
        (root, last.clone())
    } else {
        JsonPathEngine::navigate_parent_mut(root, &path.components, mkdir_p)?
    };
    match last {
        PathComponent::Key(k) => {
            if !parent.is_object() {
                return Err(SubdocEngineError::PathMismatch);
            }
            let map = parent.as_object_mut().unwrap();
            if !map.contains_key(&k) {
                if mkdir_p {
                    map.insert(k.clone(), Value::Array(Vec::new()));
                } else {
                    return Err(SubdocEngineError::PathEnoent);
                }
            }
            map.get_mut(&k)
                .unwrap()
                .as_array_mut()
                .ok_or(SubdocEngineError::PathMismatch)
        }
        PathComponent::Index(_) => parent.as_array_mut().ok_or(SubdocEngineError::PathMismatch),
    }
}

fn set_existing_component(
    parent: &mut Value,
    last: &PathComponent,
    value: Value,
) -> SubdocResult<()> {
    match last {
        PathComponent::Key(k) => {
            let map = parent.as_object_mut().ok_or(SubdocEngineError::PathMismatch)?;
            if !map.contains_key(k) {
                return Err(SubdocEngineError::PathEnoent);
            }
            map.insert(k.clone(), value);
            Ok(())
        }
        PathComponent::Index(idx) => {
            let arr = parent.as_array_mut().ok_or(SubdocEngineError::PathMismatch)?;
            let pos = resolve_index(arr.len(), *idx).ok_or(SubdocEngineError::PathEnoent)?;
            arr[pos] = value;
            Ok(())
        }
    }
}

fn remove_existing_component(parent: &mut Value, last: &PathComponent) -> SubdocResult<()> {
    match last {
        PathComponent::Key(k) => {
            let map = parent.as_object_mut().ok_or(SubdocEngineError::PathMismatch)?;
            map.remove(k).ok_or(SubdocEngineError::PathEnoent)?;
            Ok(())
        }
        PathComponent::Index(idx) => {
            let arr = parent.as_array_mut().ok_or(SubdocEngineError::PathMismatch)?;
            let pos = resolve_index(arr.len(), *idx).ok_or(SubdocEngineError::PathEnoent)?;
            arr.remove(pos);
            Ok(())
        }
    }
}

fn apply_counter(
    parent: &mut Value,
    last: &PathComponent,
    delta: i64,
    mkdir_p: bool,
) -> SubdocResult<i64> {
    match last {
        PathComponent::Key(k) => {
            let map = parent.as_object_mut().ok_or(SubdocEngineError::PathMismatch)?;
            let current = match map.get(k) {
                Some(v) => v.as_i64().ok_or(SubdocEngineError::PathMismatch)?,
                None if mkdir_p => 0,
                None => return Err(SubdocEngineError::PathEnoent),
            };
            let new_val = current.checked_add(delta).ok_or(SubdocEngineError::DeltaE2big)?;
            map.insert(k.clone(), Value::from(new_val));
            Ok(new_val)
        }
        PathComponent::Index(idx) => {
            let arr = parent.as_array_mut().ok_or(SubdocEngineError::PathMismatch)?;
            let pos = resolve_index(arr.len(), *idx).ok_or(SubdocEngineError::PathEnoent)?;
            let current = arr[pos].as_i64().ok_or(SubdocEngineError::PathMismatch)?;
            let new_val = current.checked_add(delta).ok_or(SubdocEngineError::DeltaE2big)?;
            arr[pos] = Value::from(new_val);
            Ok(new_val)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> JsonPathEngine {
        JsonPathEngine
    }

    #[test]
    fn get_returns_the_value_at_path() {
        let doc = br#"{"a":[1,2,3]}"#;
        let path = super::super::path::parse("a[1]").unwrap();
        let res = engine().lookup(SubdocCommand::Get, doc, &path).unwrap();
        assert_eq!(res.bytes, b"2");
    }

    #[test]
    fn exists_reports_enoent_for_missing_path() {
        let doc = br#"{"a":1}"#;
        let path = super::super::path::parse("b").unwrap();
        let err = engine()
            .lookup(SubdocCommand::Exists, doc, &path)
            .unwrap_err();
        assert_eq!(err, SubdocEngineError::PathEnoent);
    }

    #[test]
    fn counter_increments_nested_number() {
        let doc = br#"{"x":{"y":5}}"#;
        let path = super::super::path::parse("x.y").unwrap();
        let out = engine()
            .mutate(SubdocCommand::Counter, doc, &path, b"3", false, Some(3))
            .unwrap();
        match out {
            MutateOutcome::Applied { fragments, echo } => {
                assert_eq!(echo.unwrap().bytes, b"8");
                let new_doc: Value = serde_json::from_slice(fragments[0].bytes()).unwrap();
                assert_eq!(new_doc["x"]["y"], 8);
            }
        }
    }

    #[test]
    fn counter_accepts_a_leading_plus_sign_delta() {
        // Wire value is the textual delta, e.g. "+3" (spec scenario S3),
        // which `serde_json` would reject as a number literal if it were
        // parsed as JSON instead of left to the caller-supplied delta.
        let doc = br#"{"x":{"y":5}}"#;
        let path = super::super::path::parse("x.y").unwrap();
        let out = engine()
            .mutate(SubdocCommand::Counter, doc, &path, b"+3", false, Some(3))
            .unwrap();
        match out {
            MutateOutcome::Applied { fragments, echo } => {
                assert_eq!(echo.unwrap().bytes, b"8");
                let new_doc: Value = serde_json::from_slice(fragments[0].bytes()).unwrap();
                assert_eq!(new_doc["x"]["y"], 8);
            }
        }
    }

    #[test]
    fn dict_add_rejects_existing_key() {
        let doc = br#"{"a":1}"#;
        let path = super::super::path::parse("a").unwrap();
        let err = engine()
            .mutate(SubdocCommand::DictAdd, doc, &path, b"2", false, None)
            .unwrap_err();
        assert_eq!(err, SubdocEngineError::DocEexists);
    }

    #[test]
    fn dict_upsert_with_mkdir_p_creates_intermediate_objects() {
        let doc = br#"{}"#;
        let path = super::super::path::parse("a.b.c").unwrap();
        let out = engine()
            .mutate(SubdocCommand::DictUpsert, doc, &path, b"\"v\"", true, None)
            .unwrap();
        match out {
            MutateOutcome::Applied { fragments, .. } => {
                let new_doc: Value = serde_json::from_slice(fragments[0].bytes()).unwrap();
                assert_eq!(new_doc["a"]["b"]["c"], "v");
            }
        }
    }

    #[test]
    fn dict_upsert_without_mkdir_p_fails_on_missing_intermediate() {
        let doc = br#"{}"#;
        let path = super::super::path::parse("a.b").unwrap();
        let err = engine()
            .mutate(SubdocCommand::DictUpsert, doc, &path, b"1", false, None)
            .unwrap_err();
        assert_eq!(err, SubdocEngineError::PathEnoent);
    }

    #[test]
    fn array_push_last_appends_to_tail() {
        let doc = br#"{"a":[1,2]}"#;
        let path = super::super::path::parse("a").unwrap();
        let out = engine()
            .mutate(SubdocCommand::ArrayPushLast, doc, &path, b"3", false, None)
            .unwrap();
        match out {
            MutateOutcome::Applied { fragments, .. } => {
                let new_doc: Value = serde_json::from_slice(fragments[0].bytes()).unwrap();
                assert_eq!(new_doc["a"], serde_json::json!([1, 2, 3]));
            }
        }
    }

    #[test]
    fn array_add_unique_rejects_duplicates() {
        let doc = br#"{"a":[1,2]}"#;
        let path = super::super::path::parse("a").unwrap();
        let err = engine()
            .mutate(SubdocCommand::ArrayAddUnique, doc, &path, b"2", false, None)
            .unwrap_err();
        assert_eq!(err, SubdocEngineError::DocEexists);
    }

    #[test]
    fn delete_removes_the_path() {
        let doc = br#"{"a":1,"b":2}"#;
        let path = super::super::path::parse("a").unwrap();
        let out = engine()
            .mutate(SubdocCommand::Delete, doc, &path, b"", false, None)
            .unwrap();
        match out {
            MutateOutcome::Applied { fragments, .. } => {
                let new_doc: Value = serde_json::from_slice(fragments[0].bytes()).unwrap();
                assert_eq!(new_doc, serde_json::json!({"b": 2}));
            }
        }
    }

    #[test]
    fn replace_on_missing_path_is_enoent() {
        let doc = br#"{"a":1}"#;
        let path = super::super::path::parse("missing").unwrap();
        let err = engine()
            .mutate(SubdocCommand::Replace, doc, &path, b"1", false, None)
            .unwrap_err();
        assert_eq!(err, SubdocEngineError::PathEnoent);
    }
}
