//! Opening inputs by path: local files, glob patterns, stdin and URLs.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use superdb_error::{DbError, Result, ResultExt};
use tracing::debug;
use url::Url;

/// An HTTP request issued by a scan.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
}

pub fn is_url(path: &str) -> bool {
    matches!(Url::parse(path), Ok(u) if matches!(u.scheme(), "http" | "https"))
}

fn has_glob_meta(path: &str) -> bool {
    path.contains(['*', '?', '[', '{'])
}

/// Expands glob patterns into the sorted list of matching files. Plain
/// paths and URLs pass through unchanged.
pub fn expand_paths(paths: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for path in paths {
        if path == "-" || is_url(path) || !has_glob_meta(path) {
            out.push(path.clone());
            continue;
        }
        let matcher = Glob::new(path)
            .context_fn(|| format!("{path}: invalid glob pattern"))?
            .compile_matcher();
        let root = glob_root(path);
        let mut matches = Vec::new();
        walk(&root, &matcher, &mut matches)?;
        if matches.is_empty() {
            return Err(DbError::new(format!("{path}: no files match pattern")));
        }
        matches.sort();
        out.extend(matches.into_iter().map(|p| p.to_string_lossy().into_owned()));
    }
    Ok(out)
}

/// Longest leading directory of a pattern without glob metacharacters.
fn glob_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for comp in Path::new(pattern).components() {
        let s = comp.as_os_str().to_string_lossy();
        if has_glob_meta(&s) {
            break;
        }
        root.push(comp);
    }
    if root.as_os_str().is_empty() || root.as_path() == Path::new(pattern) {
        root = Path::new(pattern).parent().map(Path::to_path_buf).unwrap_or_default();
    }
    if root.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        root
    }
}

fn walk(dir: &Path, matcher: &GlobMatcher, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).context_fn(|| format!("{}: cannot read directory", dir.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        let path = path.strip_prefix("./").map(Path::to_path_buf).unwrap_or(path);
        if path.is_dir() {
            walk(&path, matcher, out)?;
        } else if matcher.is_match(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Opens a path for reading. `-` is stdin and http(s) URLs are fetched.
pub fn open(path: &str) -> Result<Box<dyn Read + Send>> {
    if path == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    if is_url(path) {
        let body = fetch(&HttpRequest {
            url: path.to_string(),
            method: "GET".to_string(),
            ..Default::default()
        })?;
        return Ok(Box::new(Cursor::new(body)));
    }
    let f = File::open(path).context_fn(|| format!("{path}: cannot open file"))?;
    Ok(Box::new(BufReader::new(f)))
}

/// Performs an HTTP request and returns the response body. Non-2xx
/// responses are errors.
pub fn fetch(req: &HttpRequest) -> Result<Vec<u8>> {
    let method = if req.method.is_empty() { "GET" } else { &req.method };
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .context_fn(|| format!("{method}: invalid HTTP method"))?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start HTTP runtime")?;
    debug!(url = %req.url, %method, "fetching");
    rt.block_on(async {
        let client = reqwest::Client::new();
        let mut builder = client.request(method, &req.url);
        for (name, vals) in &req.headers {
            for v in vals {
                builder = builder.header(name, v);
            }
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }
        let resp = builder
            .send()
            .await
            .context_fn(|| format!("{}: request failed", req.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DbError::new(format!("{}: {status}", req.url)));
        }
        let body = resp
            .bytes()
            .await
            .context_fn(|| format!("{}: failed to read response", req.url))?;
        Ok(body.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn glob_expansion() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.sup", "a.sup", "c.json"] {
            let mut f = File::create(dir.path().join(name)).unwrap();
            writeln!(f, "{{x:1}}").unwrap();
        }
        let pattern = format!("{}/*.sup", dir.path().display());
        let paths = expand_paths(&[pattern]).unwrap();
        assert_eq!(2, paths.len());
        assert!(paths[0].ends_with("a.sup"));
        assert!(paths[1].ends_with("b.sup"));

        let none = format!("{}/*.csv", dir.path().display());
        assert!(expand_paths(&[none]).is_err());
    }

    #[test]
    fn urls_pass_through() {
        assert!(is_url("https://example.com/a.json"));
        assert!(!is_url("a.json"));
        let paths = expand_paths(&["http://example.com/*.json".to_string()]).unwrap();
        assert_eq!(1, paths.len());
    }

    #[test]
    fn missing_file() {
        let err = open("/definitely/not/here.sup").err().unwrap();
        assert!(err.to_string().contains("cannot open file"));
    }
}
