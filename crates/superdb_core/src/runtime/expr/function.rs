//! Built-in scalar functions and user-defined function calls.
use std::cell::Cell;
use std::sync::{Arc, OnceLock, Weak};

use superdb_error::{DbError, Result};

use super::search::walk_leaves;
use super::{BoxEval, Evaluator, or_error};
use crate::types::{PrimitiveType, Type, TypeContext};
use crate::value::coerce::cast_value;
use crate::value::compare::{NullsOrder, compare_values};
use crate::value::{Value, new_array, new_record};

/// Maximum nesting of user-defined function calls on one thread.
pub const MAX_STACK_DEPTH: usize = 10_000;

/// A scalar function applied to already evaluated arguments.
pub trait Function: Send + Sync {
    fn call(&self, args: &[Value]) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Abs,
    Bucket,
    Cast,
    Ceil,
    Compare,
    Error,
    Fields,
    Floor,
    Grep,
    Has,
    IsError,
    Join,
    Len,
    Lower,
    Missing,
    Nameof,
    Quiet,
    Round,
    Split,
    Trim,
    Typename,
    Typeof,
    Upper,
}

const BUILTINS: &[(&str, Builtin, usize, usize)] = &[
    ("abs", Builtin::Abs, 1, 1),
    ("bucket", Builtin::Bucket, 2, 2),
    ("cast", Builtin::Cast, 2, 2),
    ("ceil", Builtin::Ceil, 1, 1),
    ("compare", Builtin::Compare, 2, 3),
    ("error", Builtin::Error, 1, 1),
    ("fields", Builtin::Fields, 1, 1),
    ("floor", Builtin::Floor, 1, 1),
    ("grep", Builtin::Grep, 2, 2),
    ("has", Builtin::Has, 1, usize::MAX),
    ("is_error", Builtin::IsError, 1, 1),
    ("join", Builtin::Join, 1, 2),
    ("len", Builtin::Len, 1, 1),
    ("lower", Builtin::Lower, 1, 1),
    ("missing", Builtin::Missing, 1, usize::MAX),
    ("nameof", Builtin::Nameof, 1, 1),
    ("quiet", Builtin::Quiet, 1, 1),
    ("round", Builtin::Round, 1, 1),
    ("split", Builtin::Split, 2, 2),
    ("trim", Builtin::Trim, 1, 1),
    ("typename", Builtin::Typename, 1, 1),
    ("typeof", Builtin::Typeof, 1, 1),
    ("upper", Builtin::Upper, 1, 1),
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.iter().any(|(n, ..)| *n == name)
}

/// Resolves a built-in function, checking its argument count.
pub fn lookup_function(ctx: Arc<TypeContext>, name: &str, nargs: usize) -> Result<Box<dyn Function>> {
    let Some((_, which, min, max)) = BUILTINS.iter().find(|(n, ..)| *n == name) else {
        let closest = BUILTINS
            .iter()
            .map(|(n, ..)| (strsim::levenshtein(n, name), *n))
            .min()
            .filter(|(d, _)| *d <= 2);
        let mut err = DbError::new(format!("function {name} not found"));
        if let Some((_, n)) = closest {
            err = err.with_field("did you mean", n);
        }
        return Err(err);
    };
    if nargs < *min {
        return Err(DbError::new(format!("{name}: too few arguments")));
    }
    if nargs > *max {
        return Err(DbError::new(format!("{name}: too many arguments")));
    }
    Ok(Box::new(BuiltinFn { ctx, which: *which }))
}

struct BuiltinFn {
    ctx: Arc<TypeContext>,
    which: Builtin,
}

impl BuiltinFn {
    fn string_arg(&self, name: &str, v: &Value) -> std::result::Result<Option<String>, Value> {
        if v.is_error() {
            return Err(v.clone());
        }
        if v.is_null() {
            return Ok(None);
        }
        match v.under().as_str() {
            Some(s) => Ok(Some(s.to_string())),
            None => Err(self.ctx.wrap_error(format!("{name}: string arg required"), v)),
        }
    }

    fn map_string(&self, name: &str, v: &Value, f: impl Fn(&str) -> String) -> Value {
        match self.string_arg(name, v) {
            Ok(Some(s)) => Value::from_str(&f(&s)),
            Ok(None) => Value::null_of(Type::STRING),
            Err(e) => e,
        }
    }

    fn map_number(&self, name: &str, v: &Value, f: fn(f64) -> f64) -> Value {
        if v.is_error() || v.is_null() {
            return v.clone();
        }
        let u = v.under();
        match u.typ().primitive() {
            Some(p) if p.is_float() => Value::from_float(u.typ().clone(), f(u.as_float().unwrap_or_default())),
            Some(p) if p.is_integer() && name == "abs" && p.is_signed() => {
                Value::from_int(u.typ().clone(), u.as_int().unwrap_or_default().wrapping_abs())
            }
            Some(p) if p.is_integer() => u,
            _ => self.ctx.wrap_error(format!("{name}: not a number"), v),
        }
    }
}

impl Function for BuiltinFn {
    fn call(&self, args: &[Value]) -> Value {
        let ctx = &self.ctx;
        let arg = |i: usize| args.get(i).cloned().unwrap_or_else(Value::null);
        match self.which {
            Builtin::Compare => {
                let nulls = match args.get(2) {
                    Some(v) if !v.is_true() => NullsOrder::First,
                    _ => NullsOrder::Last,
                };
                let norm = |v: Value| if v.is_missing() { Value::null() } else { v };
                let ord = compare_values(&norm(arg(0)), &norm(arg(1)), nulls);
                Value::from_int64(ord as i64)
            }
            Builtin::Len => {
                let v = arg(0);
                if v.is_error() {
                    return v;
                }
                if v.is_null() {
                    return Value::from_int64(0);
                }
                match v.len() {
                    Some(n) => Value::from_int64(n as i64),
                    None => ctx.wrap_error("len: bad type", &v),
                }
            }
            Builtin::Typeof => Value::from_type(ctx, arg(0).typ()),
            Builtin::Typename => match self.string_arg("typename", &arg(0)) {
                Ok(Some(name)) => match PrimitiveType::from_name(&name) {
                    Some(p) => Value::from_type(ctx, &Type::Primitive(p)),
                    None => match ctx.lookup_def(&name) {
                        Some(t) => Value::from_type(ctx, &t),
                        None => ctx.missing(),
                    },
                },
                Ok(None) => Value::null_of(Type::TYPE),
                Err(e) => e,
            },
            Builtin::Has => Value::from_bool(args.iter().all(|v| !v.is_missing())),
            Builtin::Missing => Value::from_bool(args.iter().any(|v| v.is_missing())),
            Builtin::Quiet => {
                let v = arg(0);
                if v.is_missing() { ctx.quiet() } else { v }
            }
            Builtin::Error => {
                let v = arg(0);
                Value::new(ctx.lookup_error(v.typ()), v.body().cloned())
            }
            Builtin::IsError => Value::from_bool(arg(0).is_error()),
            Builtin::Lower => self.map_string("lower", &arg(0), |s| s.to_lowercase()),
            Builtin::Upper => self.map_string("upper", &arg(0), |s| s.to_uppercase()),
            Builtin::Trim => self.map_string("trim", &arg(0), |s| s.trim().to_string()),
            Builtin::Split => {
                let (s, sep) = match (self.string_arg("split", &arg(0)), self.string_arg("split", &arg(1))) {
                    (Ok(Some(s)), Ok(Some(sep))) => (s, sep),
                    (Err(e), _) | (_, Err(e)) => return e,
                    _ => return Value::null_of(ctx.lookup_array(&Type::STRING)),
                };
                let parts: Vec<Value> = s.split(sep.as_str()).map(Value::from_str).collect();
                if parts.is_empty() {
                    return Value::new(ctx.lookup_array(&Type::STRING), Some(Default::default()));
                }
                or_error(ctx, new_array(ctx, &parts))
            }
            Builtin::Join => {
                let v = arg(0);
                if v.is_error() || v.is_null() {
                    return v;
                }
                let sep = match args.get(1).map(|s| self.string_arg("join", s)) {
                    Some(Ok(s)) => s.unwrap_or_default(),
                    Some(Err(e)) => return e,
                    None => String::new(),
                };
                let mut parts = Vec::new();
                for e in v.elements() {
                    match e.under().as_str() {
                        Some(s) => parts.push(s.to_string()),
                        None => return ctx.wrap_error("join: array of strings required", &v),
                    }
                }
                Value::from_str(&parts.join(&sep))
            }
            Builtin::Abs => self.map_number("abs", &arg(0), f64::abs),
            Builtin::Round => self.map_number("round", &arg(0), f64::round),
            Builtin::Floor => self.map_number("floor", &arg(0), f64::floor),
            Builtin::Ceil => self.map_number("ceil", &arg(0), f64::ceil),
            Builtin::Cast => {
                let (v, t) = (arg(0), arg(1));
                if v.is_error() {
                    return v;
                }
                let target = match t.typ().primitive() {
                    Some(PrimitiveType::Type) => t.bytes().map(|b| ctx.lookup_by_value(b)),
                    _ => None,
                };
                match target {
                    Some(Ok(typ)) => match cast_value(ctx, &v, &typ) {
                        Ok(out) => out,
                        Err(e) => ctx.wrap_error(e.get_msg(), &v),
                    },
                    _ => ctx.wrap_error("cast: type value argument required", &t),
                }
            }
            Builtin::Nameof => match arg(0).typ().named() {
                Some((name, _)) => Value::from_str(name),
                None => ctx.missing(),
            },
            Builtin::Fields => {
                let v = arg(0);
                if !v.under().typ().is_record() {
                    return ctx.missing();
                }
                let mut paths = Vec::new();
                collect_paths(ctx, &v, &mut Vec::new(), &mut paths);
                or_error(ctx, new_array(ctx, &paths))
            }
            Builtin::Grep => {
                let needle = match self.string_arg("grep", &arg(0)) {
                    Ok(Some(s)) => s.to_lowercase(),
                    Ok(None) => return Value::from_bool(false),
                    Err(e) => return e,
                };
                let hit = walk_leaves(
                    &arg(1),
                    &mut |name| name.to_lowercase().contains(&needle),
                    &mut |leaf| leaf.as_str().is_some_and(|s| s.to_lowercase().contains(&needle)),
                );
                Value::from_bool(hit)
            }
            Builtin::Bucket => {
                let (t, d) = (arg(0), arg(1));
                if t.is_error() {
                    return t;
                }
                let (Some(PrimitiveType::Time | PrimitiveType::Int64), Some(PrimitiveType::Duration)) =
                    (t.under().typ().primitive(), d.under().typ().primitive())
                else {
                    return ctx.wrap_error("bucket: time and duration arguments required", &t);
                };
                let (ts, span) = (t.under().as_int().unwrap_or_default(), d.under().as_int().unwrap_or_default());
                if span <= 0 {
                    return ctx.wrap_error("bucket: duration must be positive", &d);
                }
                Value::from_time(ts - ts.rem_euclid(span))
            }
        }
    }
}

fn collect_paths(ctx: &TypeContext, rec: &Value, prefix: &mut Vec<String>, out: &mut Vec<Value>) {
    for (name, v) in rec.fields() {
        prefix.push(name);
        if v.under().typ().is_record() {
            collect_paths(ctx, &v, prefix, out);
        } else {
            let path: Vec<Value> = prefix.iter().map(|s| Value::from_str(s)).collect();
            out.push(or_error(ctx, new_array(ctx, &path)));
        }
        prefix.pop();
    }
}

/// Call of a built-in function.
pub struct Call {
    func: Box<dyn Function>,
    args: Vec<BoxEval>,
}

impl Call {
    pub fn new(func: Box<dyn Function>, args: Vec<BoxEval>) -> Self {
        Call { func, args }
    }
}

impl Evaluator for Call {
    fn eval(&self, this: &Value) -> Value {
        let args: Vec<Value> = self.args.iter().map(|a| a.eval(this)).collect();
        self.func.call(&args)
    }
}

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A compiled user-defined function. The body is installed after creation so
/// recursive functions can refer to themselves.
pub struct Udf {
    ctx: Arc<TypeContext>,
    name: String,
    params: Vec<String>,
    body: OnceLock<BoxEval>,
}

impl Udf {
    pub fn new(ctx: Arc<TypeContext>, name: impl Into<String>, params: Vec<String>) -> Arc<Self> {
        Arc::new(Udf {
            ctx,
            name: name.into(),
            params,
            body: OnceLock::new(),
        })
    }

    pub fn set_body(&self, body: BoxEval) -> Result<()> {
        self.body
            .set(body)
            .map_err(|_| DbError::new(format!("function {} compiled twice", self.name)))
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Evaluates the body with `this` bound to a record of the arguments,
    /// or to null when the function takes none.
    pub fn invoke(&self, args: Vec<Value>) -> Value {
        let Some(body) = self.body.get() else {
            return self.ctx.new_error_string(format!("function {} has no body", self.name));
        };
        let depth = DEPTH.with(|d| {
            let n = d.get() + 1;
            d.set(n);
            n
        });
        let out = if depth > MAX_STACK_DEPTH {
            self.ctx.new_error_string(format!("stack overflow in function \"{}\"", self.name))
        } else if self.params.is_empty() {
            body.eval(&Value::null())
        } else {
            let fields = self.params.iter().cloned().zip(args).collect();
            match new_record(&self.ctx, fields) {
                Ok(rec) => body.eval(&rec),
                Err(e) => self.ctx.new_error_string(e.get_msg()),
            }
        };
        DEPTH.with(|d| d.set(d.get() - 1));
        out
    }
}

/// Call of a user-defined function. The function itself is owned by the
/// compiled query so recursive bodies do not keep themselves alive.
pub struct UdfCall {
    udf: Weak<Udf>,
    args: Vec<BoxEval>,
}

impl UdfCall {
    pub fn new(udf: &Arc<Udf>, args: Vec<BoxEval>) -> Self {
        UdfCall {
            udf: Arc::downgrade(udf),
            args,
        }
    }
}

impl Evaluator for UdfCall {
    fn eval(&self, this: &Value) -> Value {
        let args = self.args.iter().map(|a| a.eval(this)).collect();
        match self.udf.upgrade() {
            Some(udf) => udf.invoke(args),
            None => Value::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::expr::binary::{Arith, ArithOp, CompareConst, CompareOp};
    use crate::runtime::expr::{Conditional, Literal, This};
    use crate::value::sup::parse_value;

    fn call(ctx: &Arc<TypeContext>, name: &str, args: &[Value]) -> Value {
        lookup_function(ctx.clone(), name, args.len()).unwrap().call(args)
    }

    #[test]
    fn string_functions() {
        let ctx = Arc::new(TypeContext::new());
        assert_eq!("\"ABC\"", call(&ctx, "upper", &[Value::from_str("abc")]).to_string());
        assert_eq!("\"x\"", call(&ctx, "trim", &[Value::from_str("  x ")]).to_string());
        let parts = call(&ctx, "split", &[Value::from_str("a,b"), Value::from_str(",")]);
        assert_eq!(r#"["a","b"]"#, parts.to_string());
        assert_eq!("\"a-b\"", call(&ctx, "join", &[parts, Value::from_str("-")]).to_string());
        assert!(call(&ctx, "lower", &[Value::from_int64(1)]).is_error());
    }

    #[test]
    fn compare_with_nulls() {
        let ctx = Arc::new(TypeContext::new());
        let one = Value::from_int64(1);
        let null = Value::null();
        let t = Value::from_bool(true);
        let f = Value::from_bool(false);
        assert_eq!(Some(-1), call(&ctx, "compare", &[one.clone(), null.clone(), t]).as_int());
        assert_eq!(Some(1), call(&ctx, "compare", &[one.clone(), null, f]).as_int());
        assert_eq!(Some(0), call(&ctx, "compare", &[one.clone(), Value::from_float64(1.0)]).as_int());
    }

    #[test]
    fn unknown_function_suggests() {
        let ctx = Arc::new(TypeContext::new());
        let err = lookup_function(ctx.clone(), "lenn", 1).err().unwrap();
        assert_eq!(Some("len"), err.get_field("did you mean"));
        assert!(lookup_function(ctx, "len", 2).is_err());
    }

    #[test]
    fn cast_and_types() {
        let ctx = Arc::new(TypeContext::new());
        let typ = Value::from_type(&ctx, &Type::INT8);
        assert_eq!("3::int8", call(&ctx, "cast", &[Value::from_int64(3), typ.clone()]).to_string());
        assert!(call(&ctx, "cast", &[Value::from_str("x"), typ]).is_error());
        assert_eq!("<int64>", call(&ctx, "typeof", &[Value::from_int64(1)]).to_string());
        let rec = parse_value(&ctx, "{a:1,b:{c:2}}").unwrap();
        assert_eq!(r#"[["a"],["b","c"]]"#, call(&ctx, "fields", &[rec]).to_string());
    }

    #[test]
    fn recursive_udf() {
        // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
        let ctx = Arc::new(TypeContext::new());
        let udf = Udf::new(ctx.clone(), "fact", vec!["n".to_string()]);
        let n = || Box::new(This::new(ctx.clone(), vec!["n".to_string()])) as BoxEval;
        let lit = |v: i64| Box::new(Literal(Value::from_int64(v))) as BoxEval;
        let recurse = UdfCall::new(&udf, vec![Box::new(Arith::new(ctx.clone(), ArithOp::Sub, n(), lit(1)))]);
        let body = Conditional::new(
            ctx.clone(),
            Box::new(CompareConst::new(CompareOp::Le, n(), Value::from_int64(1))),
            lit(1),
            Box::new(Arith::new(ctx.clone(), ArithOp::Mul, n(), Box::new(recurse))),
        );
        udf.set_body(Box::new(body)).unwrap();
        assert_eq!("120", udf.invoke(vec![Value::from_int64(5)]).to_string());
    }

    #[test]
    fn runaway_recursion_is_an_error() {
        let ctx = Arc::new(TypeContext::new());
        let udf = Udf::new(ctx.clone(), "loop", Vec::new());
        udf.set_body(Box::new(UdfCall::new(&udf, Vec::new()))).unwrap();
        let out = std::thread::Builder::new()
            .stack_size(512 << 20)
            .spawn(move || udf.invoke(Vec::new()).to_string())
            .unwrap()
            .join()
            .unwrap();
        assert!(out.contains("stack overflow in function"));
    }
}
