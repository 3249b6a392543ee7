//! Server-side search matching.
//!
//! A search request compiles to a [`Matcher`]: a size predicate, a
//! file-or-directory mask, an extension list for typed searches, an AND
//! of case-insensitive include regexes and an optional alternation of
//! exclude regexes. Include terms may be satisfied anywhere on the path
//! from the root to the node; terms already matched by an ancestor are
//! removed from the set passed to children, which is both a pruning
//! optimization and the DC convention that tokens can be spread across
//! the path.

use crate::tree::{FileList, NodeId};
use driftdc_proto::SearchKind;
use driftdc_tth::Root;
use regex::{Regex, RegexBuilder};

/// Size predicate of a compiled search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizePred {
    /// No restriction.
    Any,
    /// Exact size.
    Eq(u64),
    /// At most.
    Le(u64),
    /// At least.
    Ge(u64),
}

impl SizePred {
    fn holds(self, size: u64) -> bool {
        match self {
            SizePred::Any => true,
            SizePred::Eq(n) => size == n,
            SizePred::Le(n) => size <= n,
            SizePred::Ge(n) => size >= n,
        }
    }
}

/// Uncompiled matcher description.
#[derive(Debug, Clone)]
pub struct MatcherSpec {
    /// Size restriction.
    pub size: SizePred,
    /// Search type selecting the kind mask and extension list.
    pub kind: SearchKind,
    /// Terms that must all match somewhere on the path.
    pub include: Vec<String>,
    /// Terms that must not match the node name.
    pub exclude: Vec<String>,
    /// Exact root for [`SearchKind::Tth`] searches.
    pub tth: Option<Root>,
}

const EXT_AUDIO: &[&str] = &[
    "aac", "ape", "flac", "m4a", "mid", "mp2", "mp3", "mpc", "ogg", "ra", "wav", "wma",
];
const EXT_ARCHIVE: &[&str] = &[
    "7z", "ace", "arj", "bz2", "gz", "lha", "lzh", "rar", "tar", "tgz", "z", "zip",
];
const EXT_DOC: &[&str] = &[
    "doc", "docx", "htm", "html", "nfo", "odp", "ods", "odt", "pdf", "ppt", "pptx", "rtf", "txt",
    "xls", "xlsx",
];
const EXT_EXE: &[&str] = &["app", "bat", "cmd", "com", "dll", "exe", "jar", "msi", "sh", "vbs"];
const EXT_IMG: &[&str] = &[
    "bmp", "gif", "ico", "jpeg", "jpg", "png", "psd", "tga", "tif", "webp",
];
const EXT_VIDEO: &[&str] = &[
    "3gp", "asf", "avi", "divx", "flv", "mkv", "mov", "mp4", "mpeg", "mpg", "ogm", "rm", "rmvb",
    "vob", "webm", "wmv",
];

/// A compiled search predicate.
pub struct Matcher {
    size: SizePred,
    match_files: bool,
    match_dirs: bool,
    exts: &'static [&'static str],
    must: Vec<Regex>,
    must_not: Option<Regex>,
    tth: Option<Root>,
}

impl Matcher {
    /// Compile a matcher.
    ///
    /// # Errors
    ///
    /// Propagates regex build failures (terms are escaped, so this only
    /// fires on pathological lengths).
    pub fn compile(spec: &MatcherSpec) -> Result<Self, regex::Error> {
        let (match_files, match_dirs, exts): (bool, bool, &'static [&'static str]) =
            match spec.kind {
                SearchKind::Any => (true, true, &[]),
                SearchKind::Audio => (true, false, EXT_AUDIO),
                SearchKind::Archive => (true, false, EXT_ARCHIVE),
                SearchKind::Doc => (true, false, EXT_DOC),
                SearchKind::Exe => (true, false, EXT_EXE),
                SearchKind::Img => (true, false, EXT_IMG),
                SearchKind::Video => (true, false, EXT_VIDEO),
                SearchKind::Dir => (false, true, &[]),
                SearchKind::Tth => (true, false, &[]),
            };
        let must = spec
            .include
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| {
                RegexBuilder::new(&regex::escape(t))
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        let must_not = if spec.exclude.is_empty() {
            None
        } else {
            let alt = spec
                .exclude
                .iter()
                .map(|t| regex::escape(t))
                .collect::<Vec<_>>()
                .join("|");
            Some(RegexBuilder::new(&alt).case_insensitive(true).build()?)
        };
        Ok(Self {
            size: spec.size,
            match_files,
            match_dirs,
            exts,
            must,
            must_not,
            tth: spec.tth,
        })
    }

    /// Node-local predicate: everything except the path-spread include
    /// terms.
    fn node_matches(&self, list: &FileList, id: NodeId) -> bool {
        let is_dir = list.is_dir(id);
        if is_dir && !self.match_dirs {
            return false;
        }
        if !is_dir && !self.match_files {
            return false;
        }
        // Directory sizes are aggregates; a size-restricted search never
        // matches a directory.
        if is_dir {
            if self.size != SizePred::Any {
                return false;
            }
        } else if !self.size.holds(list.size(id)) {
            return false;
        }
        if let Some(want) = self.tth {
            return list.tth(id) == Some(want);
        }
        let name = list.name(id);
        if !self.exts.is_empty() {
            let ext = name.rsplit_once('.').map(|(_, e)| e.to_lowercase());
            match ext {
                Some(e) if self.exts.contains(&e.as_str()) => {}
                _ => return false,
            }
        }
        if let Some(not) = &self.must_not {
            if not.is_match(name) {
                return false;
            }
        }
        true
    }

    /// Full predicate on the path from root to `id`: true iff the node
    /// would be returned by [`Matcher::search`] given enough room.
    #[must_use]
    pub fn matches(&self, list: &FileList, id: NodeId) -> bool {
        if !self.node_matches(list, id) {
            return false;
        }
        self.must.iter().all(|re| {
            let mut cur = Some(id);
            while let Some(n) = cur {
                if re.is_match(list.name(n)) {
                    return true;
                }
                cur = list.parent(n);
            }
            false
        })
    }

    /// Collect at most `max` matching nodes.
    #[must_use]
    pub fn search(&self, list: &FileList, max: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        let remaining: Vec<usize> = (0..self.must.len()).collect();
        self.recurse(list, list.root(), &remaining, max, &mut out);
        out
    }

    fn recurse(
        &self,
        list: &FileList,
        dir: NodeId,
        remaining: &[usize],
        max: usize,
        out: &mut Vec<NodeId>,
    ) {
        for &child in list.children(dir) {
            if out.len() >= max {
                return;
            }
            let name = list.name(child);
            let still: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| !self.must[i].is_match(name))
                .collect();
            if still.is_empty() && self.node_matches(list, child) {
                out.push(child);
                if out.len() >= max {
                    return;
                }
            }
            if list.is_dir(child) {
                self.recurse(list, child, &still, max, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileList {
        let mut fl = FileList::new();
        let music = fl.add_dir(fl.root(), "Music").unwrap();
        let album = fl.add_dir(music, "Best Album").unwrap();
        fl.add_file(album, "track01.mp3", 4_000_000, Root([1; 24]), None)
            .unwrap();
        fl.add_file(album, "track02.flac", 30_000_000, Root([2; 24]), None)
            .unwrap();
        fl.add_file(album, "cover.jpg", 100_000, Root([3; 24]), None)
            .unwrap();
        let docs = fl.add_dir(fl.root(), "Docs").unwrap();
        fl.add_file(docs, "readme.txt", 1000, Root([4; 24]), None)
            .unwrap();
        fl
    }

    fn spec(kind: SearchKind, include: &[&str]) -> MatcherSpec {
        MatcherSpec {
            size: SizePred::Any,
            kind,
            include: include.iter().map(|s| (*s).to_owned()).collect(),
            exclude: Vec::new(),
            tth: None,
        }
    }

    #[test]
    fn terms_spread_across_path() {
        let fl = sample();
        // "album" matches an ancestor directory, "track" the file.
        let m = Matcher::compile(&spec(SearchKind::Any, &["album", "track"])).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 2);
        for h in &hits {
            assert!(fl.name(*h).starts_with("track"));
            assert!(m.matches(&fl, *h));
        }
    }

    #[test]
    fn typed_search_filters_by_extension() {
        let fl = sample();
        let m = Matcher::compile(&spec(SearchKind::Audio, &["track"])).unwrap();
        let hits = m.search(&fl, 10);
        let names: Vec<_> = hits.iter().map(|&h| fl.name(h)).collect();
        assert_eq!(names, vec!["track01.mp3", "track02.flac"]);

        let m = Matcher::compile(&spec(SearchKind::Img, &[])).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(fl.name(hits[0]), "cover.jpg");
    }

    #[test]
    fn directory_search_matches_dirs_only() {
        let fl = sample();
        let m = Matcher::compile(&spec(SearchKind::Dir, &["album"])).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(fl.name(hits[0]), "Best Album");
    }

    #[test]
    fn size_predicates() {
        let fl = sample();
        let mut s = spec(SearchKind::Any, &["track"]);
        s.size = SizePred::Ge(10_000_000);
        let m = Matcher::compile(&s).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(fl.name(hits[0]), "track02.flac");

        s.size = SizePred::Le(5_000_000);
        let m = Matcher::compile(&s).unwrap();
        assert_eq!(m.search(&fl, 10).len(), 1);

        s.size = SizePred::Eq(1000);
        s.include = vec!["readme".into()];
        let m = Matcher::compile(&s).unwrap();
        assert_eq!(m.search(&fl, 10).len(), 1);
    }

    #[test]
    fn exclusion_terms() {
        let fl = sample();
        let mut s = spec(SearchKind::Any, &["track"]);
        s.exclude = vec!["flac".into()];
        let m = Matcher::compile(&s).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(fl.name(hits[0]), "track01.mp3");
    }

    #[test]
    fn tth_search() {
        let fl = sample();
        let s = MatcherSpec {
            size: SizePred::Any,
            kind: SearchKind::Tth,
            include: Vec::new(),
            exclude: Vec::new(),
            tth: Some(Root([2; 24])),
        };
        let m = Matcher::compile(&s).unwrap();
        let hits = m.search(&fl, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(fl.name(hits[0]), "track02.flac");
    }

    #[test]
    fn max_results_bound() {
        let fl = sample();
        let m = Matcher::compile(&spec(SearchKind::Any, &[])).unwrap();
        assert_eq!(m.search(&fl, 2).len(), 2);
        assert!(m.search(&fl, 100).len() >= 6);
        assert!(m.search(&fl, 0).is_empty());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let fl = sample();
        let m = Matcher::compile(&spec(SearchKind::Any, &["BEST", "TRACK01"])).unwrap();
        assert_eq!(m.search(&fl, 10).len(), 1);
    }

    #[test]
    fn search_agrees_with_matches_predicate() {
        // Property 8: a node is returned iff the compiled predicate
        // holds on its root path.
        let fl = sample();
        for inc in [&["album"][..], &["track", "best"][..], &["nope"][..]] {
            let m = Matcher::compile(&spec(SearchKind::Any, inc)).unwrap();
            let hits = m.search(&fl, usize::MAX);
            for node in fl.walk() {
                assert_eq!(
                    hits.contains(&node),
                    m.matches(&fl, node),
                    "node {} terms {inc:?}",
                    fl.path(node)
                );
            }
        }
    }
}
