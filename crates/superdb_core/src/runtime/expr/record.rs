//! Field path edits on record values.
use indexmap::IndexMap;
use superdb_error::{DbError, Result};

use crate::types::TypeContext;
use crate::value::{Value, new_record};

/// A record under construction: fields in order, nested records expanded
/// only where a path reaches into them.
#[derive(Debug, Default)]
struct Tree {
    fields: IndexMap<String, Node>,
}

#[derive(Debug)]
enum Node {
    Leaf(Value),
    Rec(Tree),
}

impl Tree {
    fn from_record(val: &Value) -> Tree {
        Tree {
            fields: val.fields().into_iter().map(|(k, v)| (k, Node::Leaf(v))).collect(),
        }
    }

    /// Descends to the record at `path`, expanding leaf records and
    /// replacing non-record leaves with empty records.
    fn expand(&mut self, path: &[String]) -> &mut Tree {
        let mut tree = self;
        for name in path {
            let node = tree
                .fields
                .entry(name.clone())
                .or_insert_with(|| Node::Rec(Tree::default()));
            if let Node::Leaf(v) = node {
                let sub = if v.under().typ().is_record() {
                    Tree::from_record(v)
                } else {
                    Tree::default()
                };
                *node = Node::Rec(sub);
            }
            tree = match node {
                Node::Rec(t) => t,
                Node::Leaf(_) => unreachable!("leaf replaced above"),
            };
        }
        tree
    }

    fn set(&mut self, path: &[String], val: Value) {
        if let Some((last, parent)) = path.split_last() {
            self.expand(parent).fields.insert(last.clone(), Node::Leaf(val));
        }
    }

    /// Removes the field at `path`, also removing records it leaves empty.
    fn remove(&mut self, path: &[String]) -> bool {
        match path {
            [] => false,
            [name] => self.fields.shift_remove(name).is_some(),
            [name, rest @ ..] => {
                let Some(node) = self.fields.get_mut(name) else {
                    return false;
                };
                if let Node::Leaf(v) = node {
                    if !v.under().typ().is_record() {
                        return false;
                    }
                    *node = Node::Rec(Tree::from_record(v));
                }
                let Node::Rec(sub) = node else {
                    return false;
                };
                let removed = sub.remove(rest);
                if removed && sub.fields.is_empty() {
                    self.fields.shift_remove(name);
                }
                removed
            }
        }
    }

    fn into_value(self, ctx: &TypeContext) -> Result<Value> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for (name, node) in self.fields {
            let v = match node {
                Node::Leaf(v) => v,
                Node::Rec(t) => t.into_value(ctx)?,
            };
            fields.push((name, v));
        }
        new_record(ctx, fields)
    }
}

/// Assigns `val` at `path`, creating intermediate records. An empty path
/// replaces the whole value.
pub fn put_path(ctx: &TypeContext, rec: &Value, path: &[String], val: Value) -> Result<Value> {
    put_paths(ctx, rec, vec![(path.to_vec(), val)])
}

/// Applies several assignments in order.
pub fn put_paths(ctx: &TypeContext, rec: &Value, assignments: Vec<(Vec<String>, Value)>) -> Result<Value> {
    let mut out = if rec.under().typ().is_record() {
        Some(Tree::from_record(rec))
    } else {
        None
    };
    let mut whole = None;
    for (path, val) in assignments {
        if path.is_empty() {
            if val.under().typ().is_record() {
                out = Some(Tree::from_record(&val));
                whole = None;
            } else {
                out = None;
                whole = Some(val);
            }
            continue;
        }
        out.get_or_insert_with(Tree::default).set(&path, val);
    }
    match (whole, out) {
        (Some(v), None) => Ok(v),
        (_, Some(t)) => t.into_value(ctx),
        (None, None) => Ok(rec.clone()),
    }
}

/// Removes the fields at `paths`. Returns None when no field remains.
pub fn drop_paths(ctx: &TypeContext, rec: &Value, paths: &[Vec<String>]) -> Result<Option<Value>> {
    if !rec.under().typ().is_record() {
        return Ok(Some(rec.clone()));
    }
    let mut tree = Tree::from_record(rec);
    let mut changed = false;
    for path in paths {
        changed |= tree.remove(path);
    }
    if !changed {
        return Ok(Some(rec.clone()));
    }
    if tree.fields.is_empty() {
        return Ok(None);
    }
    tree.into_value(ctx).map(Some)
}

/// Renames the field at `from` to the last element of `to`. Both paths must
/// name fields of the same parent record. The field keeps its position and
/// replaces any existing field of the new name.
pub fn rename_path(ctx: &TypeContext, rec: &Value, from: &[String], to: &[String]) -> Result<Value> {
    let (Some((old, parent)), Some((new, to_parent))) = (from.split_last(), to.split_last()) else {
        return Err(DbError::new("rename: empty field path"));
    };
    if parent != to_parent {
        return Err(DbError::new(format!(
            "rename: left-hand side and right-hand side must have the same parent: {} and {}",
            to.join("."),
            from.join(".")
        )));
    }
    if rec.deref_path(from).is_none() || !rec.under().typ().is_record() {
        return Ok(rec.clone());
    }
    let mut tree = Tree::from_record(rec);
    let sub = tree.expand(parent);
    if old != new {
        sub.fields.shift_remove(new);
        if let Some(idx) = sub.fields.get_index_of(old) {
            if let Some((_, node)) = sub.fields.shift_remove_index(idx) {
                sub.fields.shift_insert(idx, new.clone(), node);
            }
        }
    }
    tree.into_value(ctx)
}

/// Builds a record from path/value pairs, nesting by path and keeping the
/// order in which paths first appear.
pub fn build_from_paths(ctx: &TypeContext, entries: Vec<(Vec<String>, Value)>) -> Result<Value> {
    let mut tree = Tree::default();
    for (path, val) in entries {
        tree.set(&path, val);
    }
    tree.into_value(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sup::parse_value;

    fn p(s: &str) -> Vec<String> {
        s.split('.').map(|s| s.to_string()).collect()
    }

    #[test]
    fn put_creates_and_replaces() {
        let ctx = TypeContext::new();
        let rec = parse_value(&ctx, "{a:1,b:{c:2}}").unwrap();
        let out = put_path(&ctx, &rec, &p("b.d"), Value::from_int64(3)).unwrap();
        assert_eq!("{a:1,b:{c:2,d:3}}", out.to_string());
        let out = put_path(&ctx, &rec, &p("a.x"), Value::from_int64(3)).unwrap();
        assert_eq!("{a:{x:3},b:{c:2}}", out.to_string());
        let out = put_path(&ctx, &rec, &p("a"), Value::from_str("s")).unwrap();
        assert_eq!(r#"{a:"s",b:{c:2}}"#, out.to_string());
    }

    #[test]
    fn drop_removes_empty_parents() {
        let ctx = TypeContext::new();
        let rec = parse_value(&ctx, "{a:1,b:{c:2}}").unwrap();
        let out = drop_paths(&ctx, &rec, &[p("b.c")]).unwrap().unwrap();
        assert_eq!("{a:1}", out.to_string());
        assert!(drop_paths(&ctx, &rec, &[p("a"), p("b")]).unwrap().is_none());
        let same = drop_paths(&ctx, &rec, &[p("z")]).unwrap().unwrap();
        assert_eq!(rec, same);
    }

    #[test]
    fn rename_keeps_position() {
        let ctx = TypeContext::new();
        let rec = parse_value(&ctx, "{a:1,b:{c:2,d:3}}").unwrap();
        let out = rename_path(&ctx, &rec, &p("b.c"), &p("b.x")).unwrap();
        assert_eq!("{a:1,b:{x:2,d:3}}", out.to_string());
        assert!(rename_path(&ctx, &rec, &p("b.c"), &p("x")).is_err());
    }

    #[test]
    fn cut_builds_nested() {
        let ctx = TypeContext::new();
        let out = build_from_paths(
            &ctx,
            vec![
                (p("x.a"), Value::from_int64(1)),
                (p("y"), Value::from_int64(2)),
                (p("x.b"), Value::from_int64(3)),
            ],
        )
        .unwrap();
        assert_eq!("{x:{a:1,b:3},y:2}", out.to_string());
    }
}
