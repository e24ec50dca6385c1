use crate::core::entry::{Classification, Side};
use crate::core::metadata::MetaRecord;
use crate::storage::Entry;

/// 默认时间容差（秒），吸收后端时间戳截断
pub const DEFAULT_MTIME_TOLERANCE_SECS: i64 = 2;

/// 单侧条目分类器
///
/// 结果只取决于实时条目、上次同步记录以及目录是否有元数据。
#[derive(Debug, Clone)]
pub struct Classifier {
    time_tolerance_seconds: i64,
}

impl Classifier {
    pub fn new(time_tolerance_seconds: i64) -> Self {
        Self {
            time_tolerance_seconds: time_tolerance_seconds.max(0),
        }
    }

    pub fn classify(
        &self,
        live: Option<&Entry>,
        record: Option<&MetaRecord>,
        has_metadata: bool,
        side: Side,
    ) -> Classification {
        let Some(entry) = live else {
            return if record.is_some() {
                Classification::Deleted
            } else {
                Classification::Missing
            };
        };

        let Some(record) = record else {
            // 没有元数据文件时保守处理，避免首次接管时误判为大量新文件
            return if has_metadata {
                Classification::New
            } else {
                Classification::Existing
            };
        };

        match entry {
            Entry::Dir(_) if record.dir => Classification::Unmodified,
            Entry::File(file) if !record.dir => {
                let time_diff = (file.mtime - record.synced_mtime(side)).abs();
                if file.size == record.size && time_diff <= self.time_tolerance_seconds {
                    Classification::Unmodified
                } else {
                    Classification::Modified
                }
            }
            // 文件变成了目录，或者反过来
            _ => Classification::Modified,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_MTIME_TOLERANCE_SECS)
    }
}
