//! The local share: building the tree from disk, hashing, and serving
//! lookups to the hub engine and the upload side.
//!
//! Hashing runs on the blocking pool under the `hash_rate` bucket; the
//! finished tree and its lookup maps are swapped in atomically so
//! search answering never sees a half-built share.

use crate::config::Config;
use driftdc_filelist::{FileList, LocalAttrs, xml};
use driftdc_net::rate::{BURST_WAIT, Bucket};
use driftdc_transfer::peer::ShareResolver;
use driftdc_tth::{MIN_BLOCK_SIZE, Root, TthHasher, tree};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

/// Hash block granularity: at most this many blocks per file, and
/// blocks never smaller than the compaction minimum.
const MAX_BLOCKS_PER_FILE: u64 = 4096;

/// The share and its side tables.
pub struct ShareIndex {
    /// The tree consumed by hub sessions for search answering.
    pub list: Arc<RwLock<FileList>>,
    paths: RwLock<HashMap<Root, (PathBuf, u64)>>,
    leaves: RwLock<HashMap<Root, Vec<u8>>>,
    filelist_bz2: RwLock<Option<Vec<u8>>>,
}

impl Default for ShareIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareIndex {
    /// Empty share.
    #[must_use]
    pub fn new() -> Self {
        Self {
            list: Arc::new(RwLock::new(FileList::new())),
            paths: RwLock::new(HashMap::new()),
            leaves: RwLock::new(HashMap::new()),
            filelist_bz2: RwLock::new(None),
        }
    }

    /// Total shared bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.list
            .read()
            .map(|l| l.size(l.root()))
            .unwrap_or(0)
    }

    /// Rebuild from the configured directories. Walks and hashes on the
    /// blocking pool; swaps the results in when done.
    ///
    /// # Errors
    ///
    /// I/O failure on a share root. Individual unreadable files are
    /// skipped with a warning.
    pub async fn rebuild(&self, cfg: &Config, hash_bucket: Bucket) -> std::io::Result<()> {
        let dirs = cfg.share_dirs.clone();
        let opts = WalkOpts {
            hidden: cfg.share_hidden,
            symlinks: cfg.share_symlinks,
            emptydirs: cfg.share_emptydirs,
            exclude: cfg
                .share_exclude
                .as_deref()
                .and_then(|e| regex::Regex::new(e).ok()),
            flush_cache: cfg.flush_file_cache.hash,
        };
        let built = tokio::task::spawn_blocking(move || build(&dirs, &opts, &hash_bucket))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        let bz2 = xml::write_filelist(&built.list, true).ok();
        if let Ok(mut l) = self.list.write() {
            *l = built.list;
        }
        if let Ok(mut p) = self.paths.write() {
            *p = built.paths;
        }
        if let Ok(mut lv) = self.leaves.write() {
            *lv = built.leaves;
        }
        if let Ok(mut fl) = self.filelist_bz2.write() {
            *fl = bz2;
        }
        tracing::info!(bytes = self.size(), "share rebuilt");
        Ok(())
    }
}

impl ShareResolver for ShareIndex {
    fn resolve_tth(&self, root: Root) -> Option<(PathBuf, u64)> {
        self.paths.read().ok()?.get(&root).cloned()
    }

    fn filelist_bz2(&self) -> Option<Vec<u8>> {
        self.filelist_bz2.read().ok()?.clone()
    }

    fn tthl_for(&self, root: Root) -> Option<Vec<u8>> {
        self.leaves.read().ok()?.get(&root).cloned()
    }
}

struct WalkOpts {
    hidden: bool,
    symlinks: bool,
    emptydirs: bool,
    exclude: Option<regex::Regex>,
    flush_cache: bool,
}

struct Built {
    list: FileList,
    paths: HashMap<Root, (PathBuf, u64)>,
    leaves: HashMap<Root, Vec<u8>>,
}

fn build(
    dirs: &[(String, PathBuf)],
    opts: &WalkOpts,
    bucket: &Bucket,
) -> std::io::Result<Built> {
    let mut built = Built {
        list: FileList::new(),
        paths: HashMap::new(),
        leaves: HashMap::new(),
    };
    let mut next_id = 1u64;
    for (vname, dir) in dirs {
        let root = built.list.root();
        let Ok(node) = built.list.add_dir(root, vname) else {
            tracing::warn!(vname, "skipping share root with conflicting name");
            continue;
        };
        walk(&mut built, node, dir, opts, bucket, &mut next_id)?;
        if !opts.emptydirs && built.list.size(node) == 0 && built.list.children(node).is_empty()
        {
            built.list.remove(node);
        }
    }
    Ok(built)
}

fn walk(
    built: &mut Built,
    node: driftdc_filelist::NodeId,
    dir: &Path,
    opts: &WalkOpts,
    bucket: &Bucket,
    next_id: &mut u64,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.flatten().collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
            continue;
        };
        if !opts.hidden && name.starts_with('.') {
            continue;
        }
        if opts.exclude.as_ref().is_some_and(|re| re.is_match(name)) {
            continue;
        }
        let Ok(meta) = entry.path().symlink_metadata() else {
            continue;
        };
        if meta.is_symlink() && !opts.symlinks {
            continue;
        }
        let Ok(meta) = std::fs::metadata(entry.path()) else {
            continue;
        };
        if meta.is_dir() {
            let Ok(sub) = built.list.add_dir(node, name) else {
                tracing::warn!(name, "duplicate share name, skipping");
                continue;
            };
            walk(built, sub, &entry.path(), opts, bucket, next_id)?;
            if !opts.emptydirs
                && built.list.size(sub) == 0
                && built.list.children(sub).is_empty()
            {
                built.list.remove(sub);
            }
        } else if meta.is_file() {
            match hash_file(&entry.path(), meta.len(), bucket, opts.flush_cache) {
                Ok((root, leaf_blob)) => {
                    let attrs = LocalAttrs {
                        last_mod: meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map_or(0, |d| d.as_secs()),
                        id: *next_id,
                    };
                    *next_id += 1;
                    if built
                        .list
                        .add_file(node, name, meta.len(), root, Some(attrs))
                        .is_ok()
                    {
                        built.paths.insert(root, (entry.path(), meta.len()));
                        built.leaves.insert(root, leaf_blob);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "hashing failed, not shared");
                }
            }
        }
    }
    Ok(())
}

/// Hash one file under the rate bucket. Returns the root and the leaf
/// blob served on `GET tthl`.
fn hash_file(
    path: &Path,
    size: u64,
    bucket: &Bucket,
    flush_cache: bool,
) -> std::io::Result<(Root, Vec<u8>)> {
    let bs = tree::block_size(size, MAX_BLOCKS_PER_FILE).max(MIN_BLOCK_SIZE);
    let mut hasher = TthHasher::new(bs);
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let mut allowed = bucket.try_take(buf.len());
        while allowed == 0 {
            std::thread::sleep(BURST_WAIT);
            allowed = bucket.try_take(buf.len());
        }
        let n = file.read(&mut buf[..allowed])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    if flush_cache {
        driftdc_net::conn::advise_dontneed(&file);
    }
    let (root, blocks) = hasher.finalize();
    let mut blob = Vec::with_capacity(blocks.len() * 24);
    for b in &blocks {
        blob.extend_from_slice(b);
    }
    Ok((root, blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftdc_tth::tree::root_of;

    fn setup(dir: &Path) {
        std::fs::create_dir_all(dir.join("music")).unwrap();
        std::fs::write(dir.join("music/a.mp3"), vec![1u8; 3000]).unwrap();
        std::fs::write(dir.join("top.bin"), vec![2u8; 500]).unwrap();
        std::fs::write(dir.join(".hidden"), b"x").unwrap();
        std::fs::create_dir_all(dir.join("empty")).unwrap();
    }

    #[tokio::test]
    async fn rebuild_indexes_share() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let share = ShareIndex::new();
        let cfg = Config {
            share_dirs: vec![("stuff".into(), tmp.path().to_owned())],
            ..Config::default()
        };
        share.rebuild(&cfg, Bucket::new(0)).await.unwrap();

        assert_eq!(share.size(), 3500);
        let list = share.list.read().unwrap();
        // Hidden files and empty dirs are out by default.
        assert!(list.lookup_path("/stuff/.hidden").is_none());
        assert!(list.lookup_path("/stuff/empty").is_none());
        let a = list.lookup_path("/stuff/music/a.mp3").unwrap();
        let expected_root = root_of(&vec![1u8; 3000]);
        assert_eq!(list.tth(a), Some(expected_root));
        assert!(list.local_attrs(a).is_some());
        drop(list);

        // Resolver surfaces path, size, leaves and the compressed list.
        let (path, size) = share.resolve_tth(expected_root).unwrap();
        assert_eq!(size, 3000);
        assert!(path.ends_with("music/a.mp3"));
        assert!(share.tthl_for(expected_root).is_some());
        let fl = share.filelist_bz2().unwrap();
        assert_eq!(&fl[..3], b"BZh");
    }

    #[tokio::test]
    async fn exclude_regex_filters_names() {
        let tmp = tempfile::tempdir().unwrap();
        setup(tmp.path());
        let share = ShareIndex::new();
        let cfg = Config {
            share_dirs: vec![("s".into(), tmp.path().to_owned())],
            share_exclude: Some(r"\.mp3$".into()),
            ..Config::default()
        };
        share.rebuild(&cfg, Bucket::new(0)).await.unwrap();
        let list = share.list.read().unwrap();
        assert!(list.lookup_path("/s/music/a.mp3").is_none());
        assert!(list.lookup_path("/s/top.bin").is_some());
    }

    #[test]
    fn served_leaves_roll_up_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        let data = vec![7u8; 5 * 1024 * 1024];
        std::fs::write(&path, &data).unwrap();
        let (root, blob) = hash_file(&path, data.len() as u64, &Bucket::new(0), false).unwrap();
        assert_eq!(root, root_of(&data));
        driftdc_tth::verify_leaves(&blob, data.len() as u64, root).unwrap();
    }
}
