//! Expression evaluation over vectors.
//!
//! Each kernel handles the column layouts it knows and otherwise falls back
//! to the scalar semantics a slot at a time, so a kernel never disagrees
//! with its scalar counterpart.
use std::sync::Arc;

use indexmap::IndexMap;

use super::{DynamicVec, Flat, Nulls, RecordVec, Vector};
use crate::runtime::expr::binary::{ArithOp, CompareOp, and_values, arith, compare_op, not_value, or_values};
use crate::runtime::expr::{BoxEval, dot_value};
use crate::types::{Field, PrimitiveType, Type, TypeContext};
use crate::value::{Value, new_record};

pub trait VecEval: Send + Sync {
    fn eval(&self, vec: &Vector) -> Vector;
}

pub type BoxVecEval = Box<dyn VecEval>;

impl<E: VecEval + ?Sized> VecEval for Box<E> {
    fn eval(&self, vec: &Vector) -> Vector {
        self.as_ref().eval(vec)
    }
}

/// Evaluates a scalar expression slot by slot.
pub struct SlotEval(pub BoxEval);

impl VecEval for SlotEval {
    fn eval(&self, vec: &Vector) -> Vector {
        map_slots(vec, |v| self.0.eval(&v))
    }
}

pub(crate) fn map_slots(vec: &Vector, f: impl Fn(Value) -> Value) -> Vector {
    let out: Vec<Value> = (0..vec.len()).map(|i| f(vec.value_at(i))).collect();
    Vector::from_values(&out)
}

fn zip_slots(a: &Vector, b: &Vector, f: impl Fn(&Value, &Value) -> Value) -> Vector {
    let out: Vec<Value> = (0..a.len()).map(|i| f(&a.value_at(i), &b.value_at(i))).collect();
    Vector::from_values(&out)
}

fn bools(values: Vec<bool>) -> Vector {
    Vector::Bool(Flat {
        typ: Type::BOOL,
        values,
        nulls: Nulls::default(),
    })
}

pub struct VecThis {
    ctx: Arc<TypeContext>,
    path: Vec<String>,
}

impl VecThis {
    pub fn new(ctx: Arc<TypeContext>, path: Vec<String>) -> Self {
        VecThis { ctx, path }
    }
}

impl VecEval for VecThis {
    fn eval(&self, vec: &Vector) -> Vector {
        let mut out = vec.clone();
        for field in &self.path {
            out = deref(&self.ctx, &out, field, false);
        }
        out
    }
}

pub struct VecDot {
    ctx: Arc<TypeContext>,
    record: BoxVecEval,
    field: String,
}

impl VecDot {
    pub fn new(ctx: Arc<TypeContext>, record: BoxVecEval, field: String) -> Self {
        VecDot { ctx, record, field }
    }
}

impl VecEval for VecDot {
    fn eval(&self, vec: &Vector) -> Vector {
        deref(&self.ctx, &self.record.eval(vec), &self.field, true)
    }
}

/// Field access over a vector. `dot` selects expression semantics, where
/// errors pass through and maps are indexed by key, over path semantics,
/// where anything but a record field is missing.
pub fn deref(ctx: &TypeContext, vec: &Vector, field: &str, dot: bool) -> Vector {
    match vec {
        Vector::Record(rec) => match rec.typ.field_index(field) {
            Some(i) => rec.fields[i].clone(),
            None => Vector::Const(ctx.missing(), rec.len),
        },
        Vector::Named(_, inner) => deref(ctx, inner, field, dot),
        Vector::Error(..) if dot => vec.clone(),
        Vector::View(v) => deref(ctx, &v.inner, field, dot).pick(v.index.clone()),
        Vector::Dict(d) => deref(ctx, &d.values, field, dot).pick(d.index.clone()),
        Vector::Dynamic(d) => Vector::Dynamic(DynamicVec {
            tags: d.tags.clone(),
            index: d.index.clone(),
            values: d.values.iter().map(|v| deref(ctx, v, field, dot)).collect(),
        }),
        Vector::Const(val, n) => Vector::Const(deref_value(ctx, val, field, dot), *n),
        Vector::Map(_) | Vector::Union(_) => map_slots(vec, |v| deref_value(ctx, &v, field, dot)),
        _ => Vector::Const(ctx.missing(), vec.len()),
    }
}

fn deref_value(ctx: &TypeContext, val: &Value, field: &str, dot: bool) -> Value {
    if dot {
        dot_value(ctx, val, field)
    } else {
        val.deref(field).unwrap_or_else(|| ctx.missing())
    }
}

pub struct VecLiteral(pub Value);

impl VecEval for VecLiteral {
    fn eval(&self, vec: &Vector) -> Vector {
        Vector::Const(self.0.clone(), vec.len())
    }
}

/// A column of one native type, or a constant broadcast over every slot.
enum Operand<'a, T: Copy> {
    Col(&'a [T]),
    Scalar(T),
}

impl<T: Copy> Operand<'_, T> {
    fn get(&self, i: usize) -> T {
        match self {
            Operand::Col(c) => c[i],
            Operand::Scalar(v) => *v,
        }
    }
}

fn prim_of(t: &Type) -> Option<PrimitiveType> {
    t.primitive()
}

fn int_operand(v: &Vector) -> Option<(Operand<'_, i64>, PrimitiveType)> {
    match v {
        Vector::Int(f) if !f.nulls.any() => Some((Operand::Col(&f.values), prim_of(&f.typ)?)),
        Vector::Const(val, _) => {
            let p = prim_of(val.typ())?;
            p.is_signed().then(|| val.as_int().map(|i| (Operand::Scalar(i), p))).flatten()
        }
        _ => None,
    }
}

fn uint_operand(v: &Vector) -> Option<Operand<'_, u64>> {
    match v {
        Vector::Uint(f) if !f.nulls.any() && prim_of(&f.typ).is_some() => Some(Operand::Col(&f.values)),
        Vector::Const(val, _) if prim_of(val.typ()).is_some_and(|p| p.is_unsigned()) => {
            val.as_uint().map(Operand::Scalar)
        }
        _ => None,
    }
}

fn float_operand(v: &Vector) -> Option<Operand<'_, f64>> {
    match v {
        Vector::Float(f) if !f.nulls.any() => Some(Operand::Col(&f.values)),
        Vector::Const(val, _) if prim_of(val.typ()).is_some_and(|p| p.is_float()) => {
            val.as_float().map(Operand::Scalar)
        }
        _ => None,
    }
}

fn stringy_slot(v: &Vector, i: usize) -> Option<&[u8]> {
    match v {
        Vector::Bytes(b) => Some(b.slot(i)),
        Vector::Const(val, _) => val.bytes(),
        _ => None,
    }
}

fn stringy_type(v: &Vector) -> Option<PrimitiveType> {
    let p = match v {
        Vector::Bytes(b) if !b.nulls.any() => prim_of(&b.typ)?,
        Vector::Const(val, _) if !val.is_null() => prim_of(val.typ())?,
        _ => return None,
    };
    p.is_stringy().then_some(p)
}

pub struct VecCompare {
    op: CompareOp,
    lhs: BoxVecEval,
    rhs: BoxVecEval,
}

impl VecCompare {
    pub fn new(op: CompareOp, lhs: BoxVecEval, rhs: BoxVecEval) -> Self {
        VecCompare { op, lhs, rhs }
    }
}

impl VecEval for VecCompare {
    fn eval(&self, vec: &Vector) -> Vector {
        let (a, b) = (self.lhs.eval(vec), self.rhs.eval(vec));
        compare_vectors(self.op, &a, &b)
    }
}

pub fn compare_vectors(op: CompareOp, a: &Vector, b: &Vector) -> Vector {
    let n = a.len();
    if let (Some((x, px)), Some((y, py))) = (int_operand(a), int_operand(b)) {
        if (px.is_integer() && py.is_integer()) || px == py {
            return bools((0..n).map(|i| op.test(x.get(i).cmp(&y.get(i)))).collect());
        }
    }
    if let (Some(x), Some(y)) = (uint_operand(a), uint_operand(b)) {
        return bools((0..n).map(|i| op.test(x.get(i).cmp(&y.get(i)))).collect());
    }
    if let (Some(x), Some(y)) = (float_operand(a), float_operand(b)) {
        let ords: Option<Vec<bool>> = (0..n)
            .map(|i| x.get(i).partial_cmp(&y.get(i)).map(|o| op.test(o)))
            .collect();
        if let Some(out) = ords {
            return bools(out);
        }
    }
    if stringy_type(a).is_some() && stringy_type(a) == stringy_type(b) {
        let out = (0..n)
            .map(|i| {
                let (x, y) = (stringy_slot(a, i).unwrap_or_default(), stringy_slot(b, i).unwrap_or_default());
                op.test(x.cmp(y))
            })
            .collect();
        return bools(out);
    }
    zip_slots(a, b, |x, y| compare_op(op, x, y))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

pub struct VecLogic {
    ctx: Arc<TypeContext>,
    op: Logic,
    lhs: BoxVecEval,
    rhs: BoxVecEval,
}

impl VecLogic {
    pub fn new(ctx: Arc<TypeContext>, op: Logic, lhs: BoxVecEval, rhs: BoxVecEval) -> Self {
        VecLogic { ctx, op, lhs, rhs }
    }
}

impl VecEval for VecLogic {
    fn eval(&self, vec: &Vector) -> Vector {
        let (a, b) = (self.lhs.eval(vec), self.rhs.eval(vec));
        if let (Vector::Bool(x), Vector::Bool(y)) = (&a, &b) {
            if !x.nulls.any() && !y.nulls.any() {
                let out = x.values.iter().zip(&y.values);
                return bools(match self.op {
                    Logic::And => out.map(|(p, q)| *p && *q).collect(),
                    Logic::Or => out.map(|(p, q)| *p || *q).collect(),
                });
            }
        }
        match self.op {
            Logic::And => zip_slots(&a, &b, |x, y| and_values(&self.ctx, x, y)),
            Logic::Or => zip_slots(&a, &b, |x, y| or_values(&self.ctx, x, y)),
        }
    }
}

pub struct VecNot {
    ctx: Arc<TypeContext>,
    expr: BoxVecEval,
}

impl VecNot {
    pub fn new(ctx: Arc<TypeContext>, expr: BoxVecEval) -> Self {
        VecNot { ctx, expr }
    }
}

impl VecEval for VecNot {
    fn eval(&self, vec: &Vector) -> Vector {
        match self.expr.eval(vec) {
            Vector::Bool(f) => Vector::Bool(Flat {
                typ: f.typ,
                values: f.values.iter().map(|b| !b).collect(),
                nulls: f.nulls,
            }),
            other => map_slots(&other, |v| not_value(&self.ctx, &v)),
        }
    }
}

pub struct VecArith {
    ctx: Arc<TypeContext>,
    op: ArithOp,
    lhs: BoxVecEval,
    rhs: BoxVecEval,
}

impl VecArith {
    pub fn new(ctx: Arc<TypeContext>, op: ArithOp, lhs: BoxVecEval, rhs: BoxVecEval) -> Self {
        VecArith { ctx, op, lhs, rhs }
    }

    fn ints(&self, a: &Vector, b: &Vector) -> Option<Vector> {
        let ((x, px), (y, py)) = (int_operand(a)?, int_operand(b)?);
        if !(px.is_integer() && py.is_integer()) {
            return None;
        }
        let n = a.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (p, q) = (x.get(i), y.get(i));
            out.push(match self.op {
                ArithOp::Add => p.wrapping_add(q),
                ArithOp::Sub => p.wrapping_sub(q),
                ArithOp::Mul => p.wrapping_mul(q),
                ArithOp::Div | ArithOp::Mod if q == 0 => return None,
                ArithOp::Div => p.wrapping_div(q),
                ArithOp::Mod => p.wrapping_rem(q),
            });
        }
        Some(Vector::Int(Flat {
            typ: Type::INT64,
            values: out,
            nulls: Nulls::default(),
        }))
    }

    fn floats(&self, a: &Vector, b: &Vector) -> Option<Vector> {
        let (x, y) = (float_operand(a)?, float_operand(b)?);
        let n = a.len();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (p, q) = (x.get(i), y.get(i));
            out.push(match self.op {
                ArithOp::Add => p + q,
                ArithOp::Sub => p - q,
                ArithOp::Mul => p * q,
                ArithOp::Div if q == 0.0 => return None,
                ArithOp::Div => p / q,
                ArithOp::Mod => p % q,
            });
        }
        Some(Vector::Float(Flat {
            typ: Type::FLOAT64,
            values: out,
            nulls: Nulls::default(),
        }))
    }
}

impl VecEval for VecArith {
    fn eval(&self, vec: &Vector) -> Vector {
        let (a, b) = (self.lhs.eval(vec), self.rhs.eval(vec));
        if let Some(out) = self.ints(&a, &b).or_else(|| self.floats(&a, &b)) {
            return out;
        }
        zip_slots(&a, &b, |x, y| arith(&self.ctx, self.op, x, y))
    }
}

pub struct VecIsNull(pub BoxVecEval);

impl VecEval for VecIsNull {
    fn eval(&self, vec: &Vector) -> Vector {
        let v = self.0.eval(vec);
        match v.uniform_type() {
            Some(t) if !t.is_error() => bools((0..v.len()).map(|i| v.is_null_at(i)).collect()),
            _ => map_slots(&v, |x| if x.is_error() { x } else { Value::from_bool(x.is_null()) }),
        }
    }
}

/// `cond ? then : else`. Each branch is evaluated only over the slots that
/// select it.
pub struct VecConditional {
    ctx: Arc<TypeContext>,
    cond: BoxVecEval,
    then: BoxVecEval,
    otherwise: BoxVecEval,
}

impl VecConditional {
    pub fn new(ctx: Arc<TypeContext>, cond: BoxVecEval, then: BoxVecEval, otherwise: BoxVecEval) -> Self {
        VecConditional {
            ctx,
            cond,
            then,
            otherwise,
        }
    }
}

impl VecEval for VecConditional {
    fn eval(&self, vec: &Vector) -> Vector {
        let cond = self.cond.eval(vec);
        let mut then_idx = Vec::new();
        let mut else_idx = Vec::new();
        let mut errs = Vec::new();
        let mut picks = Vec::with_capacity(vec.len());
        for i in 0..cond.len() {
            let c = cond.value_at(i);
            if c.is_error() {
                picks.push((2, errs.len() as u32));
                errs.push(c);
                continue;
            }
            match c.under().as_bool() {
                Some(true) => {
                    picks.push((0, then_idx.len() as u32));
                    then_idx.push(i as u32);
                }
                Some(false) => {
                    picks.push((1, else_idx.len() as u32));
                    else_idx.push(i as u32);
                }
                None if c.is_null() => {
                    picks.push((1, else_idx.len() as u32));
                    else_idx.push(i as u32);
                }
                None => {
                    picks.push((2, errs.len() as u32));
                    errs.push(self.ctx.wrap_error("?-operator: bool predicate required", &c));
                }
            }
        }
        let branch = |e: &BoxVecEval, idx: Vec<u32>| {
            if idx.is_empty() { Vector::Null(0) } else { e.eval(&vec.pick(idx)) }
        };
        let parts = vec![
            branch(&self.then, then_idx),
            branch(&self.otherwise, else_idx),
            Vector::from_values(&errs),
        ];
        Vector::interleave(parts, picks)
    }
}

pub enum VecRecordElem {
    Field(String, BoxVecEval),
    Spread(BoxVecEval),
}

/// Record construction. Field vectors of a single type become the columns
/// of the result directly.
pub struct VecRecordExpr {
    ctx: Arc<TypeContext>,
    elems: Vec<VecRecordElem>,
}

impl VecRecordExpr {
    pub fn new(ctx: Arc<TypeContext>, elems: Vec<VecRecordElem>) -> Self {
        VecRecordExpr { ctx, elems }
    }

    fn columns(&self, cols: &IndexMap<String, Vector>, n: usize) -> Option<Vector> {
        let mut fields = Vec::with_capacity(cols.len());
        let mut vecs = Vec::with_capacity(cols.len());
        for (name, col) in cols {
            if let Vector::Const(val, _) = col {
                if val.is_missing() {
                    continue;
                }
            } else if col.uniform_type()?.is_error() {
                return None;
            }
            fields.push(Field::new(name.clone(), col.uniform_type()?));
            vecs.push(col.clone());
        }
        let typ = self.ctx.lookup_record(fields).ok()?;
        Some(Vector::Record(RecordVec {
            typ,
            fields: vecs,
            len: n,
            nulls: Nulls::default(),
        }))
    }
}

impl VecEval for VecRecordExpr {
    fn eval(&self, vec: &Vector) -> Vector {
        let n = vec.len();
        let mut cols: IndexMap<String, Vector> = IndexMap::new();
        let mut spreads = false;
        let mut evaluated = Vec::with_capacity(self.elems.len());
        for elem in &self.elems {
            match elem {
                VecRecordElem::Field(name, e) => {
                    let col = e.eval(vec);
                    cols.insert(name.clone(), col.clone());
                    evaluated.push((Some(name.clone()), col));
                }
                VecRecordElem::Spread(e) => {
                    spreads = true;
                    evaluated.push((None, e.eval(vec)));
                }
            }
        }
        if !spreads {
            if let Some(out) = self.columns(&cols, n) {
                return out;
            }
        }
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let mut fields: IndexMap<String, Value> = IndexMap::new();
            for (name, col) in &evaluated {
                let v = col.value_at(i);
                match name {
                    Some(name) if !v.is_missing() => {
                        fields.insert(name.clone(), v);
                    }
                    Some(_) => {}
                    None => fields.extend(v.fields()),
                }
            }
            let rec = new_record(&self.ctx, fields.into_iter().collect());
            out.push(rec.unwrap_or_else(|e| self.ctx.new_error_string(e.get_msg())));
        }
        Vector::from_values(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::{Evaluator, This};
    use crate::value::sup::parse_values;

    fn vector(ctx: &TypeContext, src: &str) -> Vector {
        Vector::from_values(&parse_values(ctx, src).unwrap())
    }

    fn text(v: &Vector) -> Vec<String> {
        v.values().iter().map(|v| v.to_string()).collect()
    }

    fn this(ctx: &Arc<TypeContext>, path: &str) -> BoxVecEval {
        Box::new(VecThis::new(ctx.clone(), path.split('.').map(str::to_string).collect()))
    }

    #[test]
    fn deref_through_dynamic_vectors() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{a:{b:1}} {c:2} {a:{b:\"x\"}} 7");
        let out = this(&ctx, "a.b").eval(&vec);
        assert_eq!(vec!["1", "error(\"missing\")", "\"x\"", "error(\"missing\")"], text(&out));
    }

    #[test]
    fn comparisons_match_scalar_results() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{x:1} {x:5} {x:\"a\"} {x:null} {y:1}");
        let lit = Box::new(VecLiteral(Value::from_int64(3)));
        let out = VecCompare::new(CompareOp::Lt, this(&ctx, "x"), lit).eval(&vec);
        let scalar = This::new(ctx.clone(), vec!["x".into()]);
        let want: Vec<String> = vec
            .values()
            .iter()
            .map(|v| compare_op(CompareOp::Lt, &scalar.eval(v), &Value::from_int64(3)).to_string())
            .collect();
        assert_eq!(want, text(&out));
        let flat = vector(&ctx, "{x:1} {x:5}");
        let lit = Box::new(VecLiteral(Value::from_int64(3)));
        let out = VecCompare::new(CompareOp::Lt, this(&ctx, "x"), lit).eval(&flat);
        assert!(matches!(out, Vector::Bool(_)));
        assert_eq!(vec!["true", "false"], text(&out));
    }

    #[test]
    fn arithmetic_falls_back_on_zero_divisor() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{a:6,b:3} {a:1,b:0}");
        let out = VecArith::new(ctx.clone(), ArithOp::Div, this(&ctx, "a"), this(&ctx, "b")).eval(&vec);
        assert_eq!(vec!["2", "error(\"divide by zero\")"], text(&out));
        let out = VecArith::new(ctx.clone(), ArithOp::Add, this(&ctx, "a"), this(&ctx, "b")).eval(&vec);
        assert!(matches!(out, Vector::Int(_)));
        assert_eq!(vec!["9", "1"], text(&out));
    }

    #[test]
    fn conditional_evaluates_each_branch_once() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{c:true,x:1} {c:false,x:2} {c:1,x:3}");
        let out = VecConditional::new(
            ctx.clone(),
            this(&ctx, "c"),
            this(&ctx, "x"),
            Box::new(VecLiteral(Value::from_str("no"))),
        )
        .eval(&vec);
        let got = text(&out);
        assert_eq!("1", got[0]);
        assert_eq!("\"no\"", got[1]);
        assert!(got[2].starts_with("error({message:\"?-operator"));
    }

    #[test]
    fn record_expression_builds_columns() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{a:1,b:2} {a:3,b:4}");
        let elems = vec![
            VecRecordElem::Field("s".into(), this(&ctx, "b")),
            VecRecordElem::Field("m".into(), this(&ctx, "nope")),
            VecRecordElem::Field("t".into(), this(&ctx, "a")),
        ];
        let out = VecRecordExpr::new(ctx.clone(), elems).eval(&vec);
        assert!(matches!(out, Vector::Record(_)));
        assert_eq!(vec!["{s:2,t:1}", "{s:4,t:3}"], text(&out));
    }

    #[test]
    fn logic_and_is_null() {
        let ctx = Arc::new(TypeContext::new());
        let vec = vector(&ctx, "{p:true,q:false} {p:true,q:true}");
        let out = VecLogic::new(ctx.clone(), Logic::And, this(&ctx, "p"), this(&ctx, "q")).eval(&vec);
        assert_eq!(vec!["false", "true"], text(&out));
        let out = VecNot::new(ctx.clone(), this(&ctx, "q")).eval(&vec);
        assert_eq!(vec!["true", "false"], text(&out));
        let out = VecIsNull(this(&ctx, "p")).eval(&vector(&ctx, "{p:null} {p:1}"));
        assert_eq!(vec!["true", "false"], text(&out));
    }
}
