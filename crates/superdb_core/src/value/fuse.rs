//! Type fusion: merging a stream of types into one supertype that every
//! input value can be shaped into.
use superdb_error::Result;

use super::Value;
use super::coerce::cast_value;
use crate::types::{ComplexKind, Field, Type, TypeContext};

/// Accumulates the fused supertype of every type mixed into it.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    typ: Option<Type>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mix(&mut self, ctx: &TypeContext, typ: &Type) -> Result<()> {
        self.typ = Some(match self.typ.take() {
            None => typ.clone(),
            Some(cur) => fuse_types(ctx, &cur, typ)?,
        });
        Ok(())
    }

    /// The fused type, or null when nothing was mixed in.
    pub fn typ(&self) -> Type {
        self.typ.clone().unwrap_or(Type::NULL)
    }

    /// Shapes a value into the fused type.
    pub fn shape(&self, ctx: &TypeContext, val: &Value) -> Result<Value> {
        match &self.typ {
            Some(typ) => cast_value(ctx, val, typ),
            None => Ok(val.clone()),
        }
    }
}

/// Fuses two types. Records merge field-wise in order of first appearance,
/// containers fuse their element types, anything else becomes a union.
pub fn fuse_types(ctx: &TypeContext, a: &Type, b: &Type) -> Result<Type> {
    if a == b {
        return Ok(a.clone());
    }
    if a.is_null() {
        return Ok(b.clone());
    }
    if b.is_null() {
        return Ok(a.clone());
    }
    let (ua, ub) = (a.under(), b.under());
    if let Some(t) = fuse_same_kind(ctx, ua, ub)? {
        return Ok(t);
    }
    let mut members: Vec<Type> = Vec::new();
    for t in [ua, ub] {
        match t.union_members() {
            Some(ts) => {
                for m in ts {
                    add_member(ctx, &mut members, m)?;
                }
            }
            None => add_member(ctx, &mut members, t)?,
        }
    }
    if members.len() == 1 {
        return Ok(members.remove(0));
    }
    ctx.lookup_union(members)
}

fn add_member(ctx: &TypeContext, members: &mut Vec<Type>, t: &Type) -> Result<()> {
    for m in members.iter_mut() {
        if m == t {
            return Ok(());
        }
        if let Some(fused) = fuse_same_kind(ctx, m, t)? {
            *m = fused;
            return Ok(());
        }
    }
    members.push(t.clone());
    Ok(())
}

fn fuse_same_kind(ctx: &TypeContext, a: &Type, b: &Type) -> Result<Option<Type>> {
    let (Some(ka), Some(kb)) = (a.kind(), b.kind()) else {
        return Ok(None);
    };
    let typ = match (ka, kb) {
        (ComplexKind::Record(fa), ComplexKind::Record(fb)) => {
            let mut fields: Vec<Field> = fa.to_vec();
            for f in fb {
                match fields.iter_mut().find(|x| x.name == f.name) {
                    Some(x) => x.typ = fuse_types(ctx, &x.typ, &f.typ)?,
                    None => fields.push(f.clone()),
                }
            }
            ctx.lookup_record(fields)?
        }
        (ComplexKind::Array(x), ComplexKind::Array(y)) => ctx.lookup_array(&fuse_types(ctx, x, y)?),
        (ComplexKind::Set(x), ComplexKind::Set(y)) => ctx.lookup_set(&fuse_types(ctx, x, y)?),
        (ComplexKind::Map(xk, xv), ComplexKind::Map(yk, yv)) => {
            ctx.lookup_map(&fuse_types(ctx, xk, yk)?, &fuse_types(ctx, xv, yv)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(typ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sup::parse_value;

    #[test]
    fn records_merge_fields() {
        let ctx = TypeContext::new();
        let a = parse_value(&ctx, "{k:1,v:\"a\"}").unwrap();
        let b = parse_value(&ctx, "{k:2,w:1.5}").unwrap();
        let mut schema = Schema::new();
        schema.mix(&ctx, a.typ()).unwrap();
        schema.mix(&ctx, b.typ()).unwrap();
        assert_eq!("{k:int64,v:string,w:float64}", schema.typ().to_string());
        let shaped = schema.shape(&ctx, &b).unwrap();
        assert_eq!("{k:2,v:null::string,w:1.5}", shaped.to_string());
    }

    #[test]
    fn conflicting_fields_become_unions() {
        let ctx = TypeContext::new();
        let a = parse_value(&ctx, "{x:1}").unwrap();
        let b = parse_value(&ctx, "{x:\"s\"}").unwrap();
        let t = fuse_types(&ctx, a.typ(), b.typ()).unwrap();
        assert_eq!("{x:(int64|string)}", t.to_string());
    }

    #[test]
    fn arrays_fuse_elements() {
        let ctx = TypeContext::new();
        let a = parse_value(&ctx, "[{a:1}]").unwrap();
        let b = parse_value(&ctx, "[{b:2}]").unwrap();
        let t = fuse_types(&ctx, a.typ(), b.typ()).unwrap();
        assert_eq!("[{a:int64,b:int64}]", t.to_string());
    }
}
