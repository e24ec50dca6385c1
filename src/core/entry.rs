//! 条目对：同一相对路径在两侧的视图

use crate::core::resolver::Operation;
use crate::storage::{join_path, Entry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 单侧的变化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// 本侧从未出现过，也没有同步记录
    Missing,
    /// 存在，但目录没有元数据，无法判断历史
    Existing,
    Unmodified,
    Modified,
    New,
    /// 同步过，现在不存在了
    Deleted,
}

impl Classification {
    pub const ALL: [Classification; 6] = [
        Classification::Missing,
        Classification::Existing,
        Classification::Unmodified,
        Classification::Modified,
        Classification::New,
        Classification::Deleted,
    ];
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Missing => write!(f, "missing"),
            Classification::Existing => write!(f, "existing"),
            Classification::Unmodified => write!(f, "unmodified"),
            Classification::Modified => write!(f, "modified"),
            Classification::New => write!(f, "new"),
            Classification::Deleted => write!(f, "deleted"),
        }
    }
}

/// 同步的两侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// 同一相对路径在本地和远程的条目，至少一侧存在
#[derive(Debug, Clone)]
pub struct EntryPair {
    pub name: String,
    pub rel_path: String,
    pub local: Option<Entry>,
    pub remote: Option<Entry>,
    pub local_class: Option<Classification>,
    pub remote_class: Option<Classification>,
    pub operation: Option<Operation>,
}

impl EntryPair {
    /// 两侧都为空时返回 None
    pub fn new(local: Option<Entry>, remote: Option<Entry>) -> Option<Self> {
        let any = local.as_ref().or(remote.as_ref())?;
        let name = any.name().to_string();
        let rel_path = any.rel_path().to_string();
        Some(Self {
            name,
            rel_path,
            local,
            remote,
            local_class: None,
            remote_class: None,
            operation: None,
        })
    }

    pub fn entry(&self, side: Side) -> Option<&Entry> {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }

    /// 任意一侧是目录
    pub fn is_dir(&self) -> bool {
        self.local.as_ref().is_some_and(Entry::is_dir)
            || self.remote.as_ref().is_some_and(Entry::is_dir)
    }

    /// 一侧是文件、另一侧是目录
    pub fn is_type_mismatch(&self) -> bool {
        match (&self.local, &self.remote) {
            (Some(l), Some(r)) => l.is_dir() != r.is_dir(),
            _ => false,
        }
    }

    pub fn classification(&self) -> (Classification, Classification) {
        (
            self.local_class.unwrap_or(Classification::Missing),
            self.remote_class.unwrap_or(Classification::Missing),
        )
    }
}

impl fmt::Display for EntryPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (l, r) = self.classification();
        write!(f, "{} ({}, {})", self.rel_path, l, r)
    }
}

/// 按名称配对两侧的列表，结果按名称排序
pub fn pair_entries(dir: &str, local: Vec<Entry>, remote: Vec<Entry>) -> Vec<EntryPair> {
    let mut map: BTreeMap<String, (Option<Entry>, Option<Entry>)> = BTreeMap::new();

    for entry in local {
        let name = entry.name().to_string();
        map.entry(name).or_default().0 = Some(entry);
    }
    for entry in remote {
        let name = entry.name().to_string();
        map.entry(name).or_default().1 = Some(entry);
    }

    map.into_iter()
        .filter_map(|(name, (l, r))| {
            let mut pair = EntryPair::new(l, r)?;
            pair.rel_path = join_path(dir, &name);
            Some(pair)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_requires_one_side() {
        assert!(EntryPair::new(None, None).is_none());
        let pair = EntryPair::new(Some(Entry::dir("", "d")), None).unwrap();
        assert_eq!(pair.name, "d");
        assert!(pair.is_dir());
    }

    #[test]
    fn test_pair_entries_merges_by_name() {
        let local = vec![
            Entry::file("sub", "a.txt", 1, 10, 10),
            Entry::file("sub", "c.txt", 3, 30, 30),
        ];
        let remote = vec![
            Entry::file("sub", "b.txt", 2, 20, 20),
            Entry::file("sub", "c.txt", 3, 30, 30),
        ];

        let pairs = pair_entries("sub", local, remote);
        let names: Vec<_> = pairs.iter().map(|p| p.rel_path.as_str()).collect();
        assert_eq!(names, vec!["sub/a.txt", "sub/b.txt", "sub/c.txt"]);

        assert!(pairs[0].local.is_some() && pairs[0].remote.is_none());
        assert!(pairs[1].local.is_none() && pairs[1].remote.is_some());
        assert!(pairs[2].local.is_some() && pairs[2].remote.is_some());
    }

    #[test]
    fn test_type_mismatch() {
        let pair = EntryPair::new(
            Some(Entry::file("", "x", 1, 1, 1)),
            Some(Entry::dir("", "x")),
        )
        .unwrap();
        assert!(pair.is_type_mismatch());
        assert!(pair.is_dir());
    }
}
