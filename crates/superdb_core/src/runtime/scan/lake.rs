//! Lake scanners: object listing, partitioning, sequential object scans,
//! the deleter and the metadata scans.
//!
//! Objects travel between the scanners as `data.Object` values, one per
//! batch, so a scatter hands each parallel branch whole objects.
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use superdb_error::{DbError, OptionExt, Result};
use tracing::debug;
use uuid::Uuid;

use super::{Pushdown, apply_pushdown};
use crate::lake::{BranchInfo, CommitInfo, DataObject, Lake, PoolConfig};
use crate::order::{Nulls, Which};
use crate::runtime::expr::{BoxEval, Comparator, SortEval, This};
use crate::runtime::{ArrayPuller, Batch, BoxPuller, Meter, Progress, Puller, RuntimeContext};
use crate::types::{ComplexKind, Type, TypeContext};
use crate::value::compare::{NullsOrder, compare_values};
use crate::value::{Value, new_array, new_record};

pub const OBJECT_TYPE_NAME: &str = "data.Object";
pub const PARTITION_TYPE_NAME: &str = "Partition";

fn named(ctx: &TypeContext, name: &str, rec: Value) -> Result<Value> {
    let typ = ctx.lookup_named(name, rec.typ())?;
    let (_, body) = rec.into_parts();
    Ok(Value::new(typ, body))
}

fn uuid_value(id: &Uuid) -> Value {
    Value::from_bytes(id.as_bytes())
}

pub fn object_value(ctx: &TypeContext, obj: &DataObject) -> Result<Value> {
    let rec = new_record(
        ctx,
        vec![
            ("id".to_string(), uuid_value(&obj.id)),
            ("min".to_string(), obj.min.clone()),
            ("max".to_string(), obj.max.clone()),
            ("count".to_string(), Value::from_uint64(obj.count)),
            ("size".to_string(), Value::from_uint64(obj.size)),
        ],
    )?;
    named(ctx, OBJECT_TYPE_NAME, rec)
}

pub fn object_from_value(val: &Value) -> Result<DataObject> {
    let rec = val.under();
    let id = rec.deref("id").and_then(|v| v.bytes().map(<[u8]>::to_vec)).required("object id")?;
    let id = Uuid::from_slice(&id).map_err(|_| DbError::new("malformed object id"))?;
    let field = |name: &'static str| rec.deref(name).required(name);
    Ok(DataObject {
        id,
        min: field("min")?,
        max: field("max")?,
        count: field("count")?.as_uint().unwrap_or(0),
        size: field("size")?.as_uint().unwrap_or(0),
    })
}

fn is_partition(val: &Value) -> bool {
    matches!(val.typ().kind(), Some(ComplexKind::Named(name, _)) if name == PARTITION_TYPE_NAME)
}

/// The object values a lister or slicer emitted in one batch.
fn object_values(batch: &Batch, who: &str) -> Result<Vec<Value>> {
    let [val] = batch.values() else {
        return Err(DbError::new(format!(
            "internal error: {who} encountered multi-valued batch"
        )));
    };
    if is_partition(val) {
        let objects = val.under().deref("objects").required("partition objects")?;
        return Ok(objects.elements().iter().map(Value::under).collect());
    }
    Ok(vec![val.clone()])
}

fn pruned(pruner: &Option<BoxEval>, object: &Value) -> bool {
    pruner.as_ref().is_some_and(|p| p.eval(object).is_true())
}

/// Emits the objects of a commit in pool key order, one per batch. Objects
/// whose key range the pruner rules out are skipped.
pub struct Lister {
    rctx: Arc<RuntimeContext>,
    lake: Arc<dyn Lake>,
    pool: Uuid,
    commit: Uuid,
    pruner: Option<BoxEval>,
    objects: Option<VecDeque<Value>>,
}

impl Lister {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        lake: Arc<dyn Lake>,
        pool: Uuid,
        commit: Uuid,
        pruner: Option<BoxEval>,
    ) -> Self {
        Lister {
            rctx,
            lake,
            pool,
            commit,
            pruner,
            objects: None,
        }
    }

    fn list(&self) -> Result<VecDeque<Value>> {
        let ctx = &self.rctx.ctx;
        let mut out = VecDeque::new();
        let objects = self.lake.objects(ctx, &self.pool, &self.commit)?;
        let total = objects.len();
        for obj in &objects {
            let val = object_value(ctx, obj)?;
            if !pruned(&self.pruner, &val) {
                out.push_back(val);
            }
        }
        debug!(pool = %self.pool, commit = %self.commit, total, kept = out.len(), "listed objects");
        Ok(out)
    }
}

impl Puller for Lister {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.objects = None;
            return Ok(None);
        }
        if self.objects.is_none() {
            self.objects = Some(self.list()?);
        }
        let next = self.objects.as_mut().and_then(VecDeque::pop_front);
        match next {
            Some(val) => Ok(Some(Batch::new(vec![val]))),
            None => {
                self.objects = None;
                Ok(None)
            }
        }
    }
}

/// Groups consecutive objects with overlapping key ranges into partitions
/// so that reading partitions in order yields values in pool order.
pub struct Slicer {
    ctx: Arc<TypeContext>,
    parent: BoxPuller,
    order: Which,
    current: Vec<Value>,
    lo: Value,
    hi: Value,
    eos: bool,
}

impl Slicer {
    pub fn new(ctx: Arc<TypeContext>, parent: BoxPuller, order: Which) -> Self {
        Slicer {
            ctx,
            parent,
            order,
            current: Vec::new(),
            lo: Value::null(),
            hi: Value::null(),
            eos: false,
        }
    }

    fn overlaps(&self, obj: &DataObject) -> bool {
        match self.order {
            Which::Asc => compare_values(&obj.min, &self.hi, NullsOrder::Last) != Ordering::Greater,
            Which::Desc => compare_values(&obj.max, &self.lo, NullsOrder::Last) != Ordering::Less,
        }
    }

    fn extend(&mut self, obj: &DataObject, val: Value) {
        if self.current.is_empty() {
            self.lo = obj.min.clone();
            self.hi = obj.max.clone();
        } else {
            if compare_values(&obj.min, &self.lo, NullsOrder::Last) == Ordering::Less {
                self.lo = obj.min.clone();
            }
            if compare_values(&obj.max, &self.hi, NullsOrder::Last) == Ordering::Greater {
                self.hi = obj.max.clone();
            }
        }
        self.current.push(val);
    }

    fn flush(&mut self) -> Result<Option<Batch>> {
        if self.current.is_empty() {
            return Ok(None);
        }
        let objects = new_array(&self.ctx, &std::mem::take(&mut self.current))?;
        let rec = new_record(
            &self.ctx,
            vec![
                ("min".to_string(), self.lo.clone()),
                ("max".to_string(), self.hi.clone()),
                ("objects".to_string(), objects),
            ],
        )?;
        Ok(Some(Batch::new(vec![named(&self.ctx, PARTITION_TYPE_NAME, rec)?])))
    }
}

impl Puller for Slicer {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.current.clear();
            self.eos = false;
            return self.parent.pull(true);
        }
        if self.eos {
            self.eos = false;
            return Ok(None);
        }
        loop {
            let Some(batch) = self.parent.pull(false)? else {
                let out = self.flush()?;
                self.eos = out.is_some();
                return Ok(out);
            };
            for val in object_values(&batch, "slicer")? {
                let obj = object_from_value(&val)?;
                if self.current.is_empty() || self.overlaps(&obj) {
                    self.extend(&obj, val);
                    continue;
                }
                let out = self.flush()?;
                self.extend(&obj, val);
                if out.is_some() {
                    return Ok(out);
                }
            }
        }
    }
}

/// Reads the objects (or partitions) its parent emits and streams their
/// values. The objects of a partition are merged by the pool key.
pub struct SeqScan {
    rctx: Arc<RuntimeContext>,
    lake: Arc<dyn Lake>,
    pool: Uuid,
    parent: BoxPuller,
    pushdown: Pushdown,
    pruner: Option<BoxEval>,
    merger: Option<Comparator>,
    meter: Meter,
    pending: VecDeque<Value>,
}

impl SeqScan {
    pub fn new(
        rctx: Arc<RuntimeContext>,
        lake: Arc<dyn Lake>,
        config: &PoolConfig,
        parent: BoxPuller,
        pushdown: Pushdown,
        pruner: Option<BoxEval>,
        meter: Meter,
    ) -> Self {
        let merger = config.sort_keys.first().map(|k| {
            let key = Box::new(This::new(rctx.ctx.clone(), k.key.clone()));
            Comparator::new(vec![SortEval::new(key, k.order, Nulls::Last)])
        });
        SeqScan {
            rctx,
            lake,
            pool: config.id,
            parent,
            pushdown,
            pruner,
            merger,
            meter,
            pending: VecDeque::new(),
        }
    }

    fn scan(&mut self, objects: Vec<Value>) -> Result<()> {
        let ctx = self.rctx.ctx.clone();
        let mut progress = Progress::default();
        let multi = objects.len() > 1;
        let mut vals = Vec::new();
        for val in objects {
            if pruned(&self.pruner, &val) {
                continue;
            }
            let obj = object_from_value(&val)?;
            let raw = self.lake.read_object(&ctx, &self.pool, &obj.id)?;
            vals.extend(apply_pushdown(&ctx, &self.pushdown, raw, &mut progress)?);
        }
        if multi {
            if let Some(cmp) = &self.merger {
                // Each object is sorted, so a stable sort is a merge.
                vals.sort_by(|a, b| cmp.compare(a, b));
            }
        }
        self.meter.add(progress);
        self.pending.extend(vals);
        Ok(())
    }
}

impl Puller for SeqScan {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.pending.clear();
            return self.parent.pull(true);
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.rctx.config.batch_size.max(1).min(self.pending.len());
                return Ok(Some(Batch::new(self.pending.drain(..n).collect())));
            }
            self.rctx.token().check()?;
            let Some(batch) = self.parent.pull(false)? else {
                return Ok(None);
            };
            let objects = object_values(&batch, "sequence scanner")?;
            self.scan(objects)?;
        }
    }
}

/// Ids of the objects a delete query rewrites.
#[derive(Debug, Clone, Default)]
pub struct Deletes {
    ids: Arc<Mutex<IndexSet<Uuid>>>,
}

impl Deletes {
    pub fn add(&self, id: Uuid) {
        self.ids.lock().insert(id);
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.ids.lock().iter().copied().collect()
    }
}

/// Scans objects for a delete query. An object with values matching
/// `filter` is recorded in [`Deletes`] and its surviving values are
/// emitted so they can be written back; objects without matches are
/// skipped.
pub struct Deleter {
    rctx: Arc<RuntimeContext>,
    lake: Arc<dyn Lake>,
    pool: Uuid,
    parent: BoxPuller,
    filter: Option<BoxEval>,
    pruner: Option<BoxEval>,
    deletes: Deletes,
    meter: Meter,
    pending: VecDeque<Value>,
}

impl Deleter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rctx: Arc<RuntimeContext>,
        lake: Arc<dyn Lake>,
        pool: Uuid,
        parent: BoxPuller,
        filter: Option<BoxEval>,
        pruner: Option<BoxEval>,
        deletes: Deletes,
        meter: Meter,
    ) -> Self {
        Deleter {
            rctx,
            lake,
            pool,
            parent,
            filter,
            pruner,
            deletes,
            meter,
            pending: VecDeque::new(),
        }
    }

    fn scan(&mut self, val: &Value) -> Result<()> {
        if pruned(&self.pruner, val) {
            return Ok(());
        }
        let obj = object_from_value(val)?;
        let vals = self.lake.read_object(&self.rctx.ctx, &self.pool, &obj.id)?;
        let mut progress = Progress::default();
        let mut kept = Vec::with_capacity(vals.len());
        for v in vals {
            let size = v.size() as u64;
            progress.records_read += 1;
            progress.bytes_read += size;
            // Values the filter cannot decide on are kept.
            if self.filter.as_ref().is_some_and(|f| f.eval(&v).is_true()) {
                continue;
            }
            progress.records_matched += 1;
            progress.bytes_matched += size;
            kept.push(v);
        }
        self.meter.add(progress);
        if kept.len() as u64 == obj.count {
            return Ok(());
        }
        debug!(object = %obj.id, deleted = obj.count - kept.len() as u64, "object has deletes");
        self.deletes.add(obj.id);
        self.pending.extend(kept);
        Ok(())
    }
}

impl Puller for Deleter {
    fn pull(&mut self, done: bool) -> Result<Option<Batch>> {
        if done {
            self.pending.clear();
            return self.parent.pull(true);
        }
        loop {
            if !self.pending.is_empty() {
                let n = self.rctx.config.batch_size.max(1).min(self.pending.len());
                return Ok(Some(Batch::new(self.pending.drain(..n).collect())));
            }
            let Some(batch) = self.parent.pull(false)? else {
                return Ok(None);
            };
            for val in object_values(&batch, "deleter")? {
                self.scan(&val)?;
            }
        }
    }
}

fn pool_value(ctx: &TypeContext, config: &PoolConfig) -> Result<Value> {
    let (order, keys) = match config.sort_keys.first() {
        Some(k) => (k.order, vec![Value::from_str(&k.key.join("."))]),
        None => (Which::Asc, Vec::new()),
    };
    let keys = if keys.is_empty() {
        Value::null_of(ctx.lookup_array(&Type::STRING))
    } else {
        new_array(ctx, &keys)?
    };
    let layout = new_record(
        ctx,
        vec![
            ("order".to_string(), Value::from_str(&order.to_string())),
            ("keys".to_string(), keys),
        ],
    )?;
    new_record(
        ctx,
        vec![
            ("id".to_string(), uuid_value(&config.id)),
            ("name".to_string(), Value::from_str(&config.name)),
            ("layout".to_string(), layout),
            ("threshold".to_string(), Value::from_int64(config.threshold as i64)),
        ],
    )
}

fn branch_value(ctx: &TypeContext, config: &PoolConfig, branch: &BranchInfo) -> Result<Value> {
    let b = new_record(
        ctx,
        vec![
            ("name".to_string(), Value::from_str(&branch.name)),
            ("commit".to_string(), uuid_value(&branch.commit)),
        ],
    )?;
    new_record(
        ctx,
        vec![("pool".to_string(), pool_value(ctx, config)?), ("branch".to_string(), b)],
    )
}

fn commit_value(ctx: &TypeContext, c: &CommitInfo) -> Result<Value> {
    let parent = match &c.parent {
        Some(p) => uuid_value(p),
        None => Value::null_of(Type::BYTES),
    };
    let date = c.date.timestamp_nanos_opt().unwrap_or_default();
    new_record(
        ctx,
        vec![
            ("id".to_string(), uuid_value(&c.id)),
            ("parent".to_string(), parent),
            ("author".to_string(), Value::from_str(&c.author)),
            ("date".to_string(), Value::from_time(date)),
            ("message".to_string(), Value::from_str(&c.message)),
            ("meta".to_string(), Value::from_str(&c.meta)),
        ],
    )
}

fn batched(rctx: &RuntimeContext, vals: Vec<Value>) -> BoxPuller {
    Box::new(ArrayPuller::with_batch_size(vals, rctx.config.batch_size))
}

/// Lake-wide metadata: `pools` or `branches`.
pub struct DbMetaScan;

impl DbMetaScan {
    pub fn open(rctx: &RuntimeContext, lake: &dyn Lake, meta: &str) -> Result<BoxPuller> {
        let ctx = &rctx.ctx;
        let mut vals = Vec::new();
        match meta {
            "pools" => {
                for config in lake.pools()? {
                    vals.push(pool_value(ctx, &config)?);
                }
            }
            "branches" => {
                for config in lake.pools()? {
                    for b in lake.branches(&config.id)? {
                        vals.push(branch_value(ctx, &config, &b)?);
                    }
                }
            }
            other => return Err(DbError::new(format!("unknown database metadata type: {other:?}"))),
        }
        Ok(batched(rctx, vals))
    }
}

/// Pool metadata: `branches`.
pub struct PoolMetaScan;

impl PoolMetaScan {
    pub fn open(rctx: &RuntimeContext, lake: &dyn Lake, pool: &Uuid, meta: &str) -> Result<BoxPuller> {
        if meta != "branches" {
            return Err(DbError::new(format!("unknown pool metadata type: {meta:?}")));
        }
        let config = lake.pool(pool)?;
        let vals = lake
            .branches(pool)?
            .iter()
            .map(|b| branch_value(&rctx.ctx, &config, b))
            .collect::<Result<Vec<_>>>()?;
        Ok(batched(rctx, vals))
    }
}

/// Commit metadata: `objects`, `partitions`, `log`, `rawlog` or
/// `vectors`.
pub struct CommitMetaScan;

impl CommitMetaScan {
    pub fn open(
        rctx: &Arc<RuntimeContext>,
        lake: Arc<dyn Lake>,
        pool: &Uuid,
        commit: &Uuid,
        meta: &str,
        pruner: Option<BoxEval>,
    ) -> Result<BoxPuller> {
        let ctx = &rctx.ctx;
        match meta {
            "objects" => Ok(Box::new(Lister::new(rctx.clone(), lake, *pool, *commit, pruner))),
            "partitions" => {
                let order = lake.pool(pool)?.sort_keys.first().map(|k| k.order).unwrap_or_default();
                let lister = Lister::new(rctx.clone(), lake, *pool, *commit, pruner);
                Ok(Box::new(Slicer::new(ctx.clone(), Box::new(lister), order)))
            }
            "log" | "rawlog" => {
                let mut log = lake.commit_log(pool, commit)?;
                if meta == "rawlog" {
                    log.reverse();
                }
                let vals = log.iter().map(|c| commit_value(ctx, c)).collect::<Result<Vec<_>>>()?;
                Ok(batched(rctx, vals))
            }
            // Objects carry no vector caches in this lake.
            "vectors" => Ok(batched(rctx, Vec::new())),
            other => Err(DbError::new(format!("unknown commit metadata type: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake::{CommitMessage, MemoryLake};
    use crate::order::SortKey;
    use crate::runtime::expr::binary::{CompareConst, CompareOp};
    use crate::runtime::testutil::{rctx, run};
    use crate::value::sup::parse_values;

    fn pool_with(rctx: &RuntimeContext, order: Which, threshold: usize, loads: &[&str]) -> (Arc<MemoryLake>, Uuid, Uuid) {
        let lake = Arc::new(MemoryLake::new());
        let keys = vec![SortKey::new(vec!["ts".to_string()], order)];
        let pool = lake.create_pool("p", keys, threshold).unwrap();
        let mut head = Uuid::nil();
        for src in loads {
            let vals = parse_values(&rctx.ctx, src).unwrap();
            head = lake.load(&pool, "main", vals, CommitMessage::default()).unwrap();
        }
        (lake, pool, head)
    }

    fn field(ctx: &Arc<TypeContext>, name: &str) -> BoxEval {
        Box::new(This::new(ctx.clone(), vec![name.to_string()]))
    }

    #[test]
    fn object_values_decode() {
        let rctx = rctx();
        let obj = DataObject {
            id: Uuid::new_v4(),
            min: Value::from_int64(1),
            max: Value::from_int64(9),
            count: 4,
            size: 128,
        };
        let val = object_value(&rctx.ctx, &obj).unwrap();
        let got = object_from_value(&val).unwrap();
        assert_eq!(obj.id, got.id);
        assert_eq!(Some(9), got.max.as_int());
        assert_eq!(4, got.count);

        let partial = parse_values(&rctx.ctx, "{id:0x00112233445566778899aabbccddeeff,min:1}").unwrap();
        let err = object_from_value(&partial[0]).unwrap_err();
        assert!(err.to_string().contains("max"));
    }

    #[test]
    fn lister_prunes_by_range() {
        let rctx = rctx();
        let (lake, pool, head) = pool_with(&rctx, Which::Asc, 2, &["{ts:1} {ts:2} {ts:3} {ts:4}"]);
        // Skip objects whose max is below 3.
        let pruner = Box::new(CompareConst::new(CompareOp::Lt, field(&rctx.ctx, "max"), Value::from_int64(3)));
        let mut lister = Lister::new(rctx.clone(), lake, pool, head, Some(pruner));
        let objects = crate::runtime::drain_platoon(&mut lister).unwrap();
        assert_eq!(1, objects.len());
        assert_eq!(Some(3), object_from_value(&objects[0]).unwrap().min.as_int());
    }

    #[test]
    fn sequence_scan_merges_overlapping_objects() {
        let rctx = rctx();
        let (lake, pool, head) = pool_with(&rctx, Which::Asc, 10, &["{ts:1} {ts:5}", "{ts:3} {ts:7}", "{ts:9}"]);
        let lister = Lister::new(rctx.clone(), lake.clone(), pool, head, None);
        let slicer = Slicer::new(rctx.ctx.clone(), Box::new(lister), Which::Asc);
        let config = lake.pool(&pool).unwrap();
        let meter = Meter::default();
        let mut scan = SeqScan::new(
            rctx.clone(),
            lake,
            &config,
            Box::new(slicer),
            Pushdown::default(),
            None,
            meter.clone(),
        );
        assert_eq!(vec!["{ts:1}", "{ts:3}", "{ts:5}", "{ts:7}", "{ts:9}"], run(&mut scan));
        assert_eq!(5, meter.progress().records_read);
    }

    #[test]
    fn slicer_groups_descending_ranges() {
        let rctx = rctx();
        let (lake, pool, head) = pool_with(&rctx, Which::Desc, 10, &["{ts:9} {ts:5}", "{ts:6} {ts:4}", "{ts:2}"]);
        let lister = Lister::new(rctx.clone(), lake, pool, head, None);
        let mut slicer = Slicer::new(rctx.ctx.clone(), Box::new(lister), Which::Desc);
        let parts = crate::runtime::drain_platoon(&mut slicer).unwrap();
        let sizes: Vec<usize> = parts
            .iter()
            .map(|p| p.under().deref("objects").unwrap().elements().len())
            .collect();
        assert_eq!(vec![2, 1], sizes);
    }

    #[test]
    fn deleter_records_touched_objects() {
        let rctx = rctx();
        let (lake, pool, head) = pool_with(&rctx, Which::Asc, 2, &["{ts:1} {ts:2} {ts:3} {ts:4}"]);
        let lister = Lister::new(rctx.clone(), lake.clone(), pool, head, None);
        let filter = Box::new(CompareConst::new(CompareOp::Eq, field(&rctx.ctx, "ts"), Value::from_int64(2)));
        let deletes = Deletes::default();
        let mut deleter = Deleter::new(
            rctx.clone(),
            lake.clone(),
            pool,
            Box::new(lister),
            Some(filter),
            None,
            deletes.clone(),
            Meter::default(),
        );
        assert_eq!(vec!["{ts:1}"], run(&mut deleter));
        let objects = lake.objects(&rctx.ctx, &pool, &head).unwrap();
        assert_eq!(vec![objects[0].id], deletes.ids());
    }

    #[test]
    fn metadata_scans() {
        let rctx = rctx();
        let (lake, pool, head) = pool_with(&rctx, Which::Asc, 10, &["{ts:1}"]);
        let mut pools = DbMetaScan::open(&rctx, lake.as_ref(), "pools").unwrap();
        let out = run(&mut pools);
        assert_eq!(1, out.len());
        assert!(out[0].contains("name:\"p\""));
        let mut log = CommitMetaScan::open(&rctx, lake.clone(), &pool, &head, "log", None).unwrap();
        assert_eq!(2, run(&mut log).len());
        assert!(DbMetaScan::open(&rctx, lake.as_ref(), "tables").is_err());
        assert!(PoolMetaScan::open(&rctx, lake.as_ref(), &pool, "objects").is_err());
        assert!(CommitMetaScan::open(&rctx, lake, &pool, &head, "nope", None).is_err());
    }
}
