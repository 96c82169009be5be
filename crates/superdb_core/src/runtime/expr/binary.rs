//! Logical, comparison, arithmetic and membership operators.
use std::cmp::Ordering;
use std::sync::Arc;

use super::{BoxEval, Evaluator};
use crate::types::{ComplexKind, PrimitiveType, Type, TypeContext};
use crate::value::Value;
use crate::value::compare::{NullsOrder, compare_numbers, compare_values, values_equal};

/// Checks an operand of a logical operator. Ok(None) is null.
fn logical_operand(ctx: &TypeContext, op: &str, v: &Value) -> Result<Option<bool>, Value> {
    if v.is_error() {
        return Err(v.clone());
    }
    if v.is_null() {
        return Ok(None);
    }
    match v.under().as_bool() {
        Some(b) => Ok(Some(b)),
        None => Err(ctx.wrap_error(format!("{op}: not type bool"), v)),
    }
}

/// `and`: false when either side is false, then errors, then null.
pub struct And {
    ctx: Arc<TypeContext>,
    lhs: BoxEval,
    rhs: BoxEval,
}

impl And {
    pub fn new(ctx: Arc<TypeContext>, lhs: BoxEval, rhs: BoxEval) -> Self {
        And { ctx, lhs, rhs }
    }
}

impl Evaluator for And {
    fn eval(&self, this: &Value) -> Value {
        let l = self.lhs.eval(this);
        if matches!(logical_operand(&self.ctx, "and", &l), Ok(Some(false))) {
            return Value::from_bool(false);
        }
        and_values(&self.ctx, &l, &self.rhs.eval(this))
    }
}

pub(crate) fn and_values(ctx: &TypeContext, l: &Value, r: &Value) -> Value {
    let l = logical_operand(ctx, "and", l);
    let r = logical_operand(ctx, "and", r);
    match (l, r) {
        (Ok(Some(false)), _) | (_, Ok(Some(false))) => Value::from_bool(false),
        (Err(e), _) | (_, Err(e)) => e,
        (Ok(None), _) | (_, Ok(None)) => Value::null_of(Type::BOOL),
        _ => Value::from_bool(true),
    }
}

/// `or`: true when either side is true, then errors, then null.
pub struct Or {
    ctx: Arc<TypeContext>,
    lhs: BoxEval,
    rhs: BoxEval,
}

impl Or {
    pub fn new(ctx: Arc<TypeContext>, lhs: BoxEval, rhs: BoxEval) -> Self {
        Or { ctx, lhs, rhs }
    }
}

impl Evaluator for Or {
    fn eval(&self, this: &Value) -> Value {
        let l = self.lhs.eval(this);
        if matches!(logical_operand(&self.ctx, "or", &l), Ok(Some(true))) {
            return Value::from_bool(true);
        }
        or_values(&self.ctx, &l, &self.rhs.eval(this))
    }
}

pub(crate) fn or_values(ctx: &TypeContext, l: &Value, r: &Value) -> Value {
    let l = logical_operand(ctx, "or", l);
    let r = logical_operand(ctx, "or", r);
    match (l, r) {
        (Ok(Some(true)), _) | (_, Ok(Some(true))) => Value::from_bool(true),
        (Err(e), _) | (_, Err(e)) => e,
        (Ok(None), _) | (_, Ok(None)) => Value::null_of(Type::BOOL),
        _ => Value::from_bool(false),
    }
}

pub struct Not {
    ctx: Arc<TypeContext>,
    expr: BoxEval,
}

impl Not {
    pub fn new(ctx: Arc<TypeContext>, expr: BoxEval) -> Self {
        Not { ctx, expr }
    }
}

impl Evaluator for Not {
    fn eval(&self, this: &Value) -> Value {
        not_value(&self.ctx, &self.expr.eval(this))
    }
}

pub(crate) fn not_value(ctx: &TypeContext, v: &Value) -> Value {
    match logical_operand(ctx, "not", v) {
        Ok(Some(b)) => Value::from_bool(!b),
        Ok(None) => Value::null_of(Type::BOOL),
        Err(e) => e,
    }
}

pub struct Negate {
    ctx: Arc<TypeContext>,
    expr: BoxEval,
}

impl Negate {
    pub fn new(ctx: Arc<TypeContext>, expr: BoxEval) -> Self {
        Negate { ctx, expr }
    }
}

impl Evaluator for Negate {
    fn eval(&self, this: &Value) -> Value {
        let v = self.expr.eval(this);
        if v.is_error() || v.is_null() {
            return v;
        }
        let u = v.under();
        let Some(p) = u.typ().primitive() else {
            return self.ctx.wrap_error("type incompatible with unary '-' operator", &v);
        };
        if p.is_float() {
            return Value::from_float(u.typ().clone(), -u.as_float().unwrap_or_default());
        }
        if p.is_signed() {
            return Value::from_int(u.typ().clone(), u.as_int().unwrap_or_default().wrapping_neg());
        }
        if p.is_unsigned() {
            if let Some(i) = u.as_int() {
                return Value::from_int64(-i);
            }
        }
        self.ctx.wrap_error("type incompatible with unary '-' operator", &v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn parse(op: &str) -> Option<CompareOp> {
        Some(match op {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }

    /// The operator with its operands swapped.
    pub fn mirror(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }

    pub(crate) fn test(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Comparison class of a value's type. Values compare only within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Number,
    Stringy,
    Other,
}

fn class_of(t: &Type) -> Class {
    match t.under().primitive() {
        Some(p) if p.is_number() => Class::Number,
        Some(p) if p.is_stringy() => Class::Stringy,
        _ => Class::Other,
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    let (ca, cb) = (class_of(a.typ()), class_of(b.typ()));
    match (ca, cb) {
        (Class::Number, Class::Number) | (Class::Stringy, Class::Stringy) => true,
        (Class::Other, Class::Other) => a.typ().under() == b.typ().under(),
        _ => false,
    }
}

/// Compares two evaluated operands. Errors propagate, a null operand gives
/// null and operands of incompatible types are unequal and unordered.
pub fn compare_op(op: CompareOp, a: &Value, b: &Value) -> Value {
    if a.is_error() {
        return a.clone();
    }
    if b.is_error() {
        return b.clone();
    }
    if a.is_null() || b.is_null() {
        return Value::null_of(Type::BOOL);
    }
    let (a, b) = (a.under(), b.under());
    if !comparable(&a, &b) {
        return Value::from_bool(op == CompareOp::Ne);
    }
    let ord = compare_numbers(&a, &b).unwrap_or_else(|| compare_values(&a, &b, NullsOrder::Last));
    Value::from_bool(op.test(ord))
}

pub struct Compare {
    op: CompareOp,
    lhs: BoxEval,
    rhs: BoxEval,
}

impl Compare {
    pub fn new(op: CompareOp, lhs: BoxEval, rhs: BoxEval) -> Self {
        Compare { op, lhs, rhs }
    }
}

impl Evaluator for Compare {
    fn eval(&self, this: &Value) -> Value {
        compare_op(self.op, &self.lhs.eval(this), &self.rhs.eval(this))
    }
}

/// Comparison of an expression against a constant, with the constant's
/// comparison class resolved once.
pub struct CompareConst {
    op: CompareOp,
    expr: BoxEval,
    constant: Value,
    class: Class,
}

impl CompareConst {
    /// `expr OP constant`. Use [`CompareOp::mirror`] for `constant OP expr`.
    pub fn new(op: CompareOp, expr: BoxEval, constant: Value) -> Self {
        let constant = constant.under();
        let class = class_of(constant.typ());
        CompareConst {
            op,
            expr,
            constant,
            class,
        }
    }
}

impl Evaluator for CompareConst {
    fn eval(&self, this: &Value) -> Value {
        let v = self.expr.eval(this);
        if v.is_error() {
            return v;
        }
        if v.is_null() || self.constant.is_null() {
            return Value::null_of(Type::BOOL);
        }
        let v = v.under();
        let ord = match (self.class, class_of(v.typ())) {
            (Class::Number, Class::Number) => compare_numbers(&v, &self.constant),
            (Class::Stringy, Class::Stringy) => v.bytes().map(|b| b.cmp(self.constant.bytes().unwrap_or_default())),
            (Class::Other, Class::Other) if v.typ() == self.constant.typ() => {
                Some(compare_values(&v, &self.constant, NullsOrder::Last))
            }
            _ => None,
        };
        match ord {
            Some(ord) => Value::from_bool(self.op.test(ord)),
            None => Value::from_bool(self.op == CompareOp::Ne),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn parse(op: &str) -> Option<ArithOp> {
        Some(match op {
            "+" => ArithOp::Add,
            "-" => ArithOp::Sub,
            "*" => ArithOp::Mul,
            "/" => ArithOp::Div,
            "%" => ArithOp::Mod,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

pub struct Arith {
    ctx: Arc<TypeContext>,
    op: ArithOp,
    lhs: BoxEval,
    rhs: BoxEval,
}

impl Arith {
    pub fn new(ctx: Arc<TypeContext>, op: ArithOp, lhs: BoxEval, rhs: BoxEval) -> Self {
        Arith { ctx, op, lhs, rhs }
    }
}

impl Evaluator for Arith {
    fn eval(&self, this: &Value) -> Value {
        arith(&self.ctx, self.op, &self.lhs.eval(this), &self.rhs.eval(this))
    }
}

/// Applies an arithmetic operator. Integers stay integers (signed unless
/// both sides are unsigned), any float operand gives float64, `+` joins
/// strings and time and duration follow their usual algebra.
pub fn arith(ctx: &TypeContext, op: ArithOp, a: &Value, b: &Value) -> Value {
    if a.is_error() {
        return a.clone();
    }
    if b.is_error() {
        return b.clone();
    }
    if a.is_null() || b.is_null() {
        return Value::null();
    }
    let (a, b) = (a.under(), b.under());
    let (Some(pa), Some(pb)) = (a.typ().primitive(), b.typ().primitive()) else {
        return incompatible(ctx, op, &a);
    };
    use PrimitiveType::{Duration, String as Str, Time};
    match (pa, pb) {
        (Str, Str) if op == ArithOp::Add => {
            let mut s = a.as_str().unwrap_or_default().to_string();
            s.push_str(b.as_str().unwrap_or_default());
            return Value::from_str(&s);
        }
        (Time, Time) if op == ArithOp::Sub => {
            return Value::from_duration(int(&a).wrapping_sub(int(&b)));
        }
        (Time, Duration) | (Duration, Time) if op == ArithOp::Add => {
            return Value::from_time(int(&a).wrapping_add(int(&b)));
        }
        (Time, Duration) if op == ArithOp::Sub => {
            return Value::from_time(int(&a).wrapping_sub(int(&b)));
        }
        (Duration, Duration) if matches!(op, ArithOp::Add | ArithOp::Sub | ArithOp::Mod) => {
            return int_op(ctx, op, int(&a), int(&b)).map_or_else(|e| e, |v| Value::from_duration(v));
        }
        (Duration, p) | (p, Duration) if p.is_integer() && op == ArithOp::Mul => {
            return Value::from_duration(int(&a).wrapping_mul(int(&b)));
        }
        (Duration, p) if p.is_integer() && op == ArithOp::Div => {
            return int_op(ctx, op, int(&a), int(&b)).map_or_else(|e| e, |v| Value::from_duration(v));
        }
        (Time | Duration, _) | (_, Time | Duration) => return incompatible(ctx, op, &a),
        _ => {}
    }
    if !pa.is_number() || !pb.is_number() {
        return incompatible(ctx, op, &a);
    }
    if pa.is_float() || pb.is_float() {
        let (x, y) = (a.as_float().unwrap_or_default(), b.as_float().unwrap_or_default());
        let r = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => {
                if y == 0.0 {
                    return ctx.new_error_string("divide by zero");
                }
                x / y
            }
            ArithOp::Mod => x % y,
        };
        return Value::from_float64(r);
    }
    if pa.is_unsigned() && pb.is_unsigned() {
        let (x, y) = (a.as_uint().unwrap_or_default(), b.as_uint().unwrap_or_default());
        let r = match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div | ArithOp::Mod if y == 0 => return ctx.new_error_string("divide by zero"),
            ArithOp::Div => x / y,
            ArithOp::Mod => x % y,
        };
        return Value::from_uint64(r);
    }
    match int_op(ctx, op, int(&a), int(&b)) {
        Ok(v) => Value::from_int64(v),
        Err(e) => e,
    }
}

fn int(v: &Value) -> i64 {
    v.as_int()
        .unwrap_or_else(|| v.as_uint().map(|u| u as i64).unwrap_or_default())
}

fn int_op(ctx: &TypeContext, op: ArithOp, x: i64, y: i64) -> Result<i64, Value> {
    Ok(match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Sub => x.wrapping_sub(y),
        ArithOp::Mul => x.wrapping_mul(y),
        ArithOp::Div | ArithOp::Mod if y == 0 => return Err(ctx.new_error_string("divide by zero")),
        ArithOp::Div => x.wrapping_div(y),
        ArithOp::Mod => x.wrapping_rem(y),
    })
}

fn incompatible(ctx: &TypeContext, op: ArithOp, v: &Value) -> Value {
    ctx.wrap_error(format!("type incompatible with '{}' operator", op.symbol()), v)
}

/// Membership of a value in a container: array and set elements, map keys
/// and record field values. Any other container matches by equality.
pub fn contains(elem: &Value, container: &Value) -> bool {
    let c = container.under();
    match c.typ().kind() {
        Some(ComplexKind::Array(_)) | Some(ComplexKind::Set(_)) => {
            c.elements().iter().any(|e| values_equal(elem, &e.under()))
        }
        Some(ComplexKind::Map(..)) => c
            .elements()
            .iter()
            .step_by(2)
            .any(|k| values_equal(elem, &k.under())),
        Some(ComplexKind::Record(_)) => c.fields().iter().any(|(_, v)| values_equal(elem, &v.under())),
        _ => values_equal(elem, &c),
    }
}

pub struct In {
    elem: BoxEval,
    container: BoxEval,
}

impl In {
    pub fn new(elem: BoxEval, container: BoxEval) -> Self {
        In { elem, container }
    }
}

impl Evaluator for In {
    fn eval(&self, this: &Value) -> Value {
        let elem = self.elem.eval(this);
        if elem.is_error() {
            return elem;
        }
        let container = self.container.eval(this);
        if container.is_error() {
            return container;
        }
        Value::from_bool(contains(&elem.under(), &container))
    }
}

/// `constant in expr` with the constant fixed at compile time.
pub struct ContainsConst {
    constant: Value,
    container: BoxEval,
}

impl ContainsConst {
    pub fn new(constant: Value, container: BoxEval) -> Self {
        ContainsConst {
            constant: constant.under(),
            container,
        }
    }
}

impl Evaluator for ContainsConst {
    fn eval(&self, this: &Value) -> Value {
        let container = self.container.eval(this);
        if container.is_error() {
            return container;
        }
        Value::from_bool(contains(&self.constant, &container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::{Literal, This};
    use crate::value::sup::parse_value;

    fn lit(v: Value) -> BoxEval {
        Box::new(Literal(v))
    }

    #[test]
    fn three_valued_logic() {
        let ctx = Arc::new(TypeContext::new());
        let t = || lit(Value::from_bool(true));
        let f = || lit(Value::from_bool(false));
        let n = || lit(Value::null_of(Type::BOOL));
        let m = || lit(ctx.missing());
        assert!(!And::new(ctx.clone(), m(), f()).eval(&Value::null()).is_true());
        assert_eq!(Some(false), And::new(ctx.clone(), m(), f()).eval(&Value::null()).as_bool());
        assert!(And::new(ctx.clone(), m(), t()).eval(&Value::null()).is_missing());
        assert!(And::new(ctx.clone(), n(), t()).eval(&Value::null()).is_null());
        assert!(Or::new(ctx.clone(), m(), t()).eval(&Value::null()).is_true());
        assert!(Or::new(ctx.clone(), m(), f()).eval(&Value::null()).is_missing());
        assert!(Not::new(ctx.clone(), lit(Value::from_int64(1))).eval(&Value::null()).is_error());
    }

    #[test]
    fn comparisons_across_types() {
        let one = Value::from_int64(1);
        let one_u = Value::from_uint(Type::UINT8, 1);
        assert!(compare_op(CompareOp::Eq, &one, &one_u).is_true());
        assert!(compare_op(CompareOp::Lt, &one, &Value::from_float64(1.5)).is_true());
        assert!(!compare_op(CompareOp::Lt, &one, &Value::from_str("a")).is_true());
        assert!(compare_op(CompareOp::Ne, &one, &Value::from_str("a")).is_true());
        assert!(compare_op(CompareOp::Eq, &one, &Value::null()).is_null());
    }

    #[test]
    fn constant_comparison() {
        let ctx = Arc::new(TypeContext::new());
        let rec = parse_value(&ctx, r#"{s:"hello",x:3}"#).unwrap();
        let x = || Box::new(This::new(ctx.clone(), vec!["x".to_string()])) as BoxEval;
        let s = || Box::new(This::new(ctx.clone(), vec!["s".to_string()])) as BoxEval;
        assert!(CompareConst::new(CompareOp::Gt, x(), Value::from_int64(2)).eval(&rec).is_true());
        assert!(CompareConst::new(CompareOp::Gt.mirror(), x(), Value::from_int64(2)).eval(&rec).as_bool() == Some(false));
        assert!(CompareConst::new(CompareOp::Eq, s(), Value::from_str("hello")).eval(&rec).is_true());
        assert!(!CompareConst::new(CompareOp::Eq, s(), Value::from_int64(1)).eval(&rec).is_true());
    }

    #[test]
    fn arithmetic() {
        let ctx = TypeContext::new();
        let i = Value::from_int64;
        assert_eq!("5", arith(&ctx, ArithOp::Add, &i(2), &i(3)).to_string());
        assert_eq!("2", arith(&ctx, ArithOp::Div, &i(7), &i(3)).to_string());
        assert_eq!("3.5", arith(&ctx, ArithOp::Div, &Value::from_float64(7.0), &i(2)).to_string());
        assert!(arith(&ctx, ArithOp::Div, &i(1), &i(0)).is_error());
        assert_eq!("\"ab\"", arith(&ctx, ArithOp::Add, &Value::from_str("a"), &Value::from_str("b")).to_string());
        assert!(arith(&ctx, ArithOp::Mul, &Value::from_str("a"), &i(2)).is_error());
        assert_eq!("2s", arith(&ctx, ArithOp::Sub, &Value::from_time(3_000_000_000), &Value::from_time(1_000_000_000)).to_string());
    }

    #[test]
    fn membership() {
        let ctx = TypeContext::new();
        let arr = parse_value(&ctx, "[1,2,3]").unwrap();
        assert!(contains(&Value::from_int64(2), &arr));
        assert!(!contains(&Value::from_int64(4), &arr));
        let m = parse_value(&ctx, r#"|{"a":1}|"#).unwrap();
        assert!(contains(&Value::from_str("a"), &m));
        let c = ContainsConst::new(Value::from_int64(3), Box::new(Literal(arr)));
        assert!(c.eval(&Value::null()).is_true());
    }
}
