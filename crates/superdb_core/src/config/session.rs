use std::collections::HashMap;
use std::sync::LazyLock;

use superdb_error::{DbError, Result};

use crate::csup::DEFAULT_OBJECT_VALUES;
use crate::value::Value;

pub const DEFAULT_BATCH_SIZE: usize = 2048;
pub const DEFAULT_SORT_MEM_BYTES: usize = 128 * 1024 * 1024;
pub const DEFAULT_BSUP_READ_SIZE: usize = 512 * 1024;
pub const DEFAULT_BSUP_READ_MAX: usize = 50 * 1024 * 1024;

/// Environment variable that selects the vector runtime when non-empty.
pub const VECTOR_ENV: &str = "SUPER_VAM";

/// Configuration for a query session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub parallelism: usize,
    pub vector_execution: bool,
    pub batch_size: usize,
    pub csup_object_values: usize,
    pub sort_mem_bytes: usize,
    pub bsup_threads: usize,
    pub bsup_read_size: usize,
    pub bsup_read_max: usize,
    pub bsup_validate: bool,
    pub csv_delim: u8,
    pub dynamic: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            parallelism: num_cpus::get(),
            vector_execution: false,
            batch_size: DEFAULT_BATCH_SIZE,
            csup_object_values: DEFAULT_OBJECT_VALUES,
            sort_mem_bytes: DEFAULT_SORT_MEM_BYTES,
            bsup_threads: 0,
            bsup_read_size: DEFAULT_BSUP_READ_SIZE,
            bsup_read_max: DEFAULT_BSUP_READ_MAX,
            bsup_validate: false,
            csv_delim: b',',
            dynamic: false,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut conf = Self::default();
        conf.apply_env(|name| std::env::var(name).ok());
        conf
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if lookup(VECTOR_ENV).is_some_and(|v| !v.is_empty()) {
            self.vector_execution = true;
        }
    }

    pub fn set_from_value(&mut self, name: &str, value: &Value) -> Result<()> {
        let func = lookup_setting(name)?;
        (func.set)(value, self)
    }

    pub fn get_as_value(&self, name: &str) -> Result<Value> {
        let func = lookup_setting(name)?;
        Ok((func.get)(self))
    }

    pub fn reset(&mut self, name: &str) -> Result<()> {
        let def_conf = Self::default();
        let func = lookup_setting(name)?;
        let val = (func.get)(&def_conf);
        (func.set)(&val, self)
    }

    /// Names of every registered setting, sorted.
    pub fn setting_names() -> Vec<&'static str> {
        let mut names: Vec<_> = GET_SET_FUNCTIONS.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn lookup_setting(name: &str) -> Result<&'static SettingFunctions> {
    GET_SET_FUNCTIONS.get(name).ok_or_else(|| {
        let mut err = DbError::new(format!("Missing setting for '{name}'"));
        let best = GET_SET_FUNCTIONS
            .keys()
            .map(|k| (strsim::jaro_winkler(k, name), *k))
            .filter(|(score, _)| *score > 0.8)
            .max_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((_, k)) = best {
            err = err.with_field("suggestion", k);
        }
        err
    })
}

struct SettingFunctions {
    set: fn(value: &Value, conf: &mut SessionConfig) -> Result<()>,
    get: fn(conf: &SessionConfig) -> Value,
}

impl SettingFunctions {
    const fn new<S: SessionSetting>() -> Self {
        SettingFunctions {
            set: S::set_from_value as _,
            get: S::get_as_value as _,
        }
    }
}

fn insert_setting<S: SessionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<Parallelism>(&mut map);
    insert_setting::<VectorExecution>(&mut map);
    insert_setting::<BatchSize>(&mut map);
    insert_setting::<CsupObjectValues>(&mut map);
    insert_setting::<SortMemBytes>(&mut map);
    insert_setting::<BsupThreads>(&mut map);
    insert_setting::<BsupReadSize>(&mut map);
    insert_setting::<BsupReadMax>(&mut map);
    insert_setting::<BsupValidate>(&mut map);
    insert_setting::<CsvDelim>(&mut map);
    insert_setting::<Dynamic>(&mut map);

    map
});

pub trait SessionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()>;
    fn get_as_value(conf: &SessionConfig) -> Value;
}

fn try_as_bool(name: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| DbError::new(format!("Setting '{name}' expects a bool, got {value}")))
}

fn try_as_usize(name: &str, value: &Value) -> Result<usize> {
    value
        .as_uint()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| DbError::new(format!("Setting '{name}' expects a non-negative integer, got {value}")))
}

fn check_bounds(name: &str, val: usize, min: usize, max: usize) -> Result<()> {
    if val < min {
        return Err(DbError::new(format!("Setting '{name}' cannot be less than {min}")));
    }
    if val > max {
        return Err(DbError::new(format!("Setting '{name}' cannot be greater than {max}")));
    }
    Ok(())
}

const MAX_PARALLELISM: usize = 512;

pub struct Parallelism;

impl SessionSetting for Parallelism {
    const NAME: &'static str = "parallelism";
    const DESCRIPTION: &'static str = "Number of concurrent paths a query may be split into";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 1, MAX_PARALLELISM)?;
        conf.parallelism = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.parallelism as u64)
    }
}

pub struct VectorExecution;

impl SessionSetting for VectorExecution {
    const NAME: &'static str = "vector_execution";
    const DESCRIPTION: &'static str = "Run queries on the columnar runtime";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        conf.vector_execution = try_as_bool(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_bool(conf.vector_execution)
    }
}

const MAX_BATCH_SIZE: usize = 8192;

pub struct BatchSize;

impl SessionSetting for BatchSize {
    const NAME: &'static str = "batch_size";
    const DESCRIPTION: &'static str = "Desired number of values in a batch";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 1, MAX_BATCH_SIZE)?;
        conf.batch_size = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.batch_size as u64)
    }
}

pub struct CsupObjectValues;

impl SessionSetting for CsupObjectValues {
    const NAME: &'static str = "csup_object_values";
    const DESCRIPTION: &'static str = "Values per CSUP object before the writer starts a new one";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 1, usize::MAX)?;
        conf.csup_object_values = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.csup_object_values as u64)
    }
}

pub struct SortMemBytes;

impl SessionSetting for SortMemBytes {
    const NAME: &'static str = "sort_mem_bytes";
    const DESCRIPTION: &'static str = "Bytes a sort buffers in memory before spilling a run to disk";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 1, usize::MAX)?;
        conf.sort_mem_bytes = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.sort_mem_bytes as u64)
    }
}

pub struct BsupThreads;

impl SessionSetting for BsupThreads {
    const NAME: &'static str = "bsup_threads";
    const DESCRIPTION: &'static str = "BSUP decoding workers, zero for one per logical CPU";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 0, MAX_PARALLELISM)?;
        conf.bsup_threads = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.bsup_threads as u64)
    }
}

pub struct BsupReadSize;

impl SessionSetting for BsupReadSize {
    const NAME: &'static str = "bsup_read_size";
    const DESCRIPTION: &'static str = "Target read buffer size for BSUP input";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, 1, conf.bsup_read_max)?;
        conf.bsup_read_size = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.bsup_read_size as u64)
    }
}

pub struct BsupReadMax;

impl SessionSetting for BsupReadMax {
    const NAME: &'static str = "bsup_read_max";
    const DESCRIPTION: &'static str = "Largest BSUP frame the reader accepts";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let val = try_as_usize(Self::NAME, value)?;
        check_bounds(Self::NAME, val, conf.bsup_read_size, usize::MAX)?;
        conf.bsup_read_max = val;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_uint64(conf.bsup_read_max as u64)
    }
}

pub struct BsupValidate;

impl SessionSetting for BsupValidate {
    const NAME: &'static str = "bsup_validate";
    const DESCRIPTION: &'static str = "Validate decoded BSUP values against their types";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        conf.bsup_validate = try_as_bool(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_bool(conf.bsup_validate)
    }
}

pub struct CsvDelim;

impl SessionSetting for CsvDelim {
    const NAME: &'static str = "csv_delim";
    const DESCRIPTION: &'static str = "Single character CSV field delimiter";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        let s = value
            .as_str()
            .ok_or_else(|| DbError::new(format!("Setting '{}' expects a string, got {value}", Self::NAME)))?;
        conf.csv_delim = parse_delim(s)?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_str(&(conf.csv_delim as char).to_string())
    }
}

/// Parses a CSV delimiter, which must be a single ASCII character.
pub fn parse_delim(s: &str) -> Result<u8> {
    match s.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ => Err(DbError::new(format!("CSV delimiter must be a single ASCII character: {s:?}"))),
    }
}

pub struct Dynamic;

impl SessionSetting for Dynamic {
    const NAME: &'static str = "dynamic";
    const DESCRIPTION: &'static str = "Disable static type checking at compile time";

    fn set_from_value(value: &Value, conf: &mut SessionConfig) -> Result<()> {
        conf.dynamic = try_as_bool(Self::NAME, value)?;
        Ok(())
    }

    fn get_as_value(conf: &SessionConfig) -> Value {
        Value::from_bool(conf.dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_setting_exists() {
        let mut conf = SessionConfig::default();
        conf.set_from_value("batch_size", &Value::from_int64(100)).unwrap();
        let val = conf.get_as_value("batch_size").unwrap();
        assert_eq!(Some(100), val.as_uint());
    }

    #[test]
    fn set_setting_not_exists() {
        let mut conf = SessionConfig::default();
        let err = conf.set_from_value("batch_sise", &Value::from_int64(1)).unwrap_err();
        assert_eq!(Some("batch_size"), err.get_field("suggestion"));
    }

    #[test]
    fn bounds_checked() {
        let mut conf = SessionConfig::default();
        conf.set_from_value("parallelism", &Value::from_int64(0)).unwrap_err();
        conf.set_from_value("csv_delim", &Value::from_str(";;")).unwrap_err();
        conf.set_from_value("csv_delim", &Value::from_str(";")).unwrap();
        assert_eq!(b';', conf.csv_delim);
    }

    #[test]
    fn reset_restores_default() {
        let mut conf = SessionConfig::default();
        conf.set_from_value("vector_execution", &Value::from_bool(true)).unwrap();
        conf.reset("vector_execution").unwrap();
        assert!(!conf.vector_execution);
    }

    #[test]
    fn env_selects_vector_path() {
        let mut conf = SessionConfig::default();
        conf.apply_env(|_| Some(String::new()));
        assert!(!conf.vector_execution);
        conf.apply_env(|name| (name == VECTOR_ENV).then(|| "1".to_string()));
        assert!(conf.vector_execution);
    }
}
