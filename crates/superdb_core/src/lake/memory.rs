use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use superdb_error::{DbError, OptionExt, Result};
use tracing::debug;
use uuid::Uuid;

use super::{BranchInfo, CommitInfo, CommitMessage, DataObject, Lake, PoolConfig};
use crate::bsup;
use crate::io::{ValueReader, ValueWriter};
use crate::order::{SortKeys, Which};
use crate::types::TypeContext;
use crate::value::Value;
use crate::value::compare::{NullsOrder, compare_values};

struct StoredObject {
    meta: DataObject,
    data: Bytes,
}

struct Commit {
    info: CommitInfo,
    objects: Vec<Uuid>,
}

struct Pool {
    config: PoolConfig,
    branches: HashMap<String, Uuid>,
    commits: HashMap<Uuid, Commit>,
    objects: HashMap<Uuid, StoredObject>,
}

/// In-memory lake. Objects are stored as BSUP.
pub struct MemoryLake {
    ctx: Arc<TypeContext>,
    pools: RwLock<HashMap<Uuid, Pool>>,
}

impl Default for MemoryLake {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLake {
    pub fn new() -> Self {
        MemoryLake {
            ctx: Arc::new(TypeContext::new()),
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a pool with an empty `main` branch.
    pub fn create_pool(&self, name: &str, sort_keys: SortKeys, threshold: usize) -> Result<Uuid> {
        let mut pools = self.pools.write();
        if pools.values().any(|p| p.config.name == name) {
            return Err(DbError::new(format!("{name}: pool already exists")));
        }
        let id = Uuid::new_v4();
        let root = Uuid::new_v4();
        let mut commits = HashMap::new();
        commits.insert(
            root,
            Commit {
                info: CommitInfo {
                    id: root,
                    parent: None,
                    author: String::new(),
                    message: "initial commit".to_string(),
                    meta: String::new(),
                    date: Utc::now(),
                },
                objects: Vec::new(),
            },
        );
        let mut branches = HashMap::new();
        branches.insert("main".to_string(), root);
        pools.insert(
            id,
            Pool {
                config: PoolConfig {
                    id,
                    name: name.to_string(),
                    sort_keys,
                    threshold: threshold.max(1),
                },
                branches,
                commits,
                objects: HashMap::new(),
            },
        );
        debug!(%id, name, "created pool");
        Ok(id)
    }

    pub fn pool_by_name(&self, name: &str) -> Result<PoolConfig> {
        self.pools
            .read()
            .values()
            .find(|p| p.config.name == name)
            .map(|p| p.config.clone())
            .ok_or_else(|| DbError::new(format!("{name}: pool not found")))
    }

    /// Head commit of a branch.
    pub fn branch_head(&self, pool: &Uuid, branch: &str) -> Result<Uuid> {
        let pools = self.pools.read();
        let pool = lookup(&pools, pool)?;
        pool.branches
            .get(branch)
            .copied()
            .ok_or_else(|| DbError::new(format!("{branch}: branch not found")))
    }

    fn key_order(config: &PoolConfig) -> (Option<Vec<String>>, Which) {
        match config.sort_keys.first() {
            Some(k) => (Some(k.key.clone()), k.order),
            None => (None, Which::Asc),
        }
    }

    /// Sorts values by the pool key and cuts them into objects.
    fn build_objects(&self, config: &PoolConfig, mut vals: Vec<Value>) -> Result<Vec<StoredObject>> {
        let (key, order) = Self::key_order(config);
        let key_of = |v: &Value| match &key {
            Some(path) => v.deref_path(path).unwrap_or_else(Value::null),
            None => Value::null(),
        };
        if key.is_some() {
            vals.sort_by(|a, b| {
                let ord = compare_values(&key_of(a), &key_of(b), NullsOrder::Last);
                match order {
                    Which::Asc => ord,
                    Which::Desc => ord.reverse(),
                }
            });
        }
        let mut out = Vec::new();
        for chunk in vals.chunks(config.threshold) {
            let mut w = bsup::Writer::new(Vec::new());
            let mut min: Option<Value> = None;
            let mut max: Option<Value> = None;
            for v in chunk {
                let local = self.ctx.translate_value(v)?;
                w.write(&local)?;
                let k = key_of(&local);
                if min.as_ref().is_none_or(|m| compare_values(&k, m, NullsOrder::Last) == Ordering::Less) {
                    min = Some(k.clone());
                }
                if max.as_ref().is_none_or(|m| compare_values(&k, m, NullsOrder::Last) == Ordering::Greater) {
                    max = Some(k);
                }
            }
            w.close()?;
            let data = Bytes::from(w.into_inner());
            out.push(StoredObject {
                meta: DataObject {
                    id: Uuid::new_v4(),
                    min: min.unwrap_or_else(Value::null),
                    max: max.unwrap_or_else(Value::null),
                    count: chunk.len() as u64,
                    size: data.len() as u64,
                },
                data,
            });
        }
        Ok(out)
    }

    fn sort_objects(config: &PoolConfig, objects: &HashMap<Uuid, StoredObject>, ids: &mut [Uuid]) {
        let (_, order) = Self::key_order(config);
        ids.sort_by(|a, b| {
            let (Some(a), Some(b)) = (objects.get(a), objects.get(b)) else {
                return Ordering::Equal;
            };
            match order {
                Which::Asc => compare_values(&a.meta.min, &b.meta.min, NullsOrder::Last),
                Which::Desc => compare_values(&b.meta.max, &a.meta.max, NullsOrder::Last),
            }
        });
    }
}

fn lookup<'a>(pools: &'a HashMap<Uuid, Pool>, id: &Uuid) -> Result<&'a Pool> {
    pools
        .get(id)
        .ok_or_else(|| DbError::new(format!("{id}: pool not found")))
}

impl Lake for MemoryLake {
    fn pools(&self) -> Result<Vec<PoolConfig>> {
        let mut out: Vec<PoolConfig> = self.pools.read().values().map(|p| p.config.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn pool(&self, id: &Uuid) -> Result<PoolConfig> {
        Ok(lookup(&self.pools.read(), id)?.config.clone())
    }

    fn branches(&self, pool: &Uuid) -> Result<Vec<BranchInfo>> {
        let pools = self.pools.read();
        let mut out: Vec<BranchInfo> = lookup(&pools, pool)?
            .branches
            .iter()
            .map(|(name, commit)| BranchInfo {
                name: name.clone(),
                commit: *commit,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn commit_log(&self, pool: &Uuid, commit: &Uuid) -> Result<Vec<CommitInfo>> {
        let pools = self.pools.read();
        let pool = lookup(&pools, pool)?;
        let mut out = Vec::new();
        let mut next = Some(*commit);
        while let Some(id) = next {
            let c = pool.commits.get(&id).required("commit")?;
            out.push(c.info.clone());
            next = c.info.parent;
        }
        Ok(out)
    }

    fn objects(&self, ctx: &TypeContext, pool: &Uuid, commit: &Uuid) -> Result<Vec<DataObject>> {
        let pools = self.pools.read();
        let pool = lookup(&pools, pool)?;
        let c = pool
            .commits
            .get(commit)
            .ok_or_else(|| DbError::new(format!("{commit}: commit not found")))?;
        c.objects
            .iter()
            .map(|id| {
                let obj = pool.objects.get(id).required("data object")?;
                Ok(DataObject {
                    min: ctx.translate_value(&obj.meta.min)?,
                    max: ctx.translate_value(&obj.meta.max)?,
                    ..obj.meta.clone()
                })
            })
            .collect()
    }

    fn read_object(&self, ctx: &Arc<TypeContext>, pool: &Uuid, object: &Uuid) -> Result<Vec<Value>> {
        let data = {
            let pools = self.pools.read();
            let pool = lookup(&pools, pool)?;
            pool.objects
                .get(object)
                .ok_or_else(|| DbError::new(format!("{object}: data object not found")))?
                .data
                .clone()
        };
        let mut r = bsup::Reader::new(ctx.clone(), data.as_ref());
        let mut out = Vec::new();
        while let Some(v) = r.read()? {
            out.push(v);
        }
        Ok(out)
    }

    fn load(&self, pool: &Uuid, branch: &str, vals: Vec<Value>, msg: CommitMessage) -> Result<Uuid> {
        self.replace(pool, branch, &[], vals, msg)
    }

    fn replace(
        &self,
        pool_id: &Uuid,
        branch: &str,
        deleted: &[Uuid],
        vals: Vec<Value>,
        msg: CommitMessage,
    ) -> Result<Uuid> {
        let config = self.pool(pool_id)?;
        let built = self.build_objects(&config, vals)?;
        let mut pools = self.pools.write();
        let pool = pools
            .get_mut(pool_id)
            .ok_or_else(|| DbError::new(format!("{pool_id}: pool not found")))?;
        let head = *pool
            .branches
            .get(branch)
            .ok_or_else(|| DbError::new(format!("{branch}: branch not found")))?;
        let mut objects: Vec<Uuid> = pool
            .commits
            .get(&head)
            .required("branch head commit")?
            .objects
            .iter()
            .filter(|id| !deleted.contains(id))
            .copied()
            .collect();
        for obj in built {
            objects.push(obj.meta.id);
            pool.objects.insert(obj.meta.id, obj);
        }
        Self::sort_objects(&config, &pool.objects, &mut objects);
        let id = Uuid::new_v4();
        pool.commits.insert(
            id,
            Commit {
                info: CommitInfo {
                    id,
                    parent: Some(head),
                    author: msg.author,
                    message: msg.message,
                    meta: msg.meta,
                    date: Utc::now(),
                },
                objects,
            },
        );
        pool.branches.insert(branch.to_string(), id);
        debug!(pool = %pool_id, branch, commit = %id, deleted = deleted.len(), "committed");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::SortKey;
    use crate::value::sup::parse_values;

    #[test]
    fn load_sorts_and_splits() {
        let lake = MemoryLake::new();
        let keys = vec![SortKey::new(vec!["ts".to_string()], Which::Asc)];
        let pool = lake.create_pool("p", keys, 2).unwrap();
        let ctx = Arc::new(TypeContext::new());
        let vals = parse_values(&ctx, "{ts:3} {ts:1} {ts:2} {ts:5} {ts:4}").unwrap();
        let commit = lake.load(&pool, "main", vals, CommitMessage::default()).unwrap();
        assert_eq!(commit, lake.branch_head(&pool, "main").unwrap());

        let objects = lake.objects(&ctx, &pool, &commit).unwrap();
        let ranges: Vec<(i64, i64)> = objects
            .iter()
            .map(|o| (o.min.as_int().unwrap(), o.max.as_int().unwrap()))
            .collect();
        assert_eq!(vec![(1, 2), (3, 4), (5, 5)], ranges);

        let vals = lake.read_object(&ctx, &pool, &objects[1].id).unwrap();
        let text: Vec<String> = vals.iter().map(|v| v.to_string()).collect();
        assert_eq!(vec!["{ts:3}", "{ts:4}"], text);
        assert_eq!(2, lake.commit_log(&pool, &commit).unwrap().len());
    }

    #[test]
    fn replace_drops_objects() {
        let lake = MemoryLake::new();
        let pool = lake.create_pool("p", SortKeys::new(), 10).unwrap();
        let ctx = Arc::new(TypeContext::new());
        let c1 = lake
            .load(&pool, "main", parse_values(&ctx, "1 2").unwrap(), CommitMessage::default())
            .unwrap();
        let first = lake.objects(&ctx, &pool, &c1).unwrap();
        let c2 = lake
            .replace(&pool, "main", &[first[0].id], parse_values(&ctx, "3").unwrap(), CommitMessage::default())
            .unwrap();
        let objects = lake.objects(&ctx, &pool, &c2).unwrap();
        assert_eq!(1, objects.len());
        assert_eq!(1, objects[0].count);
        assert!(lake.create_pool("p", SortKeys::new(), 1).is_err());
    }
}
