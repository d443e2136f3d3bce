use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::index::KeyPath;
use crate::loader::Loader;

impl Loader {
    /// 查询路由：返回与 `[start, end]` 有交集的物理索引名（排序、去重）。
    ///
    /// 没有任何命中（包括 `paths` 为空、路径不存在）时返回 `default_index`。
    pub async fn indices(
        &self,
        token: &CancellationToken,
        start: SystemTime,
        end: SystemTime,
        paths: &[KeyPath],
    ) -> Vec<String> {
        let Some(root) = self.wait_and_get_indices(token).await else {
            return vec![self.cfg.default_index.clone()];
        };
        let mut names = Vec::new();
        for path in paths {
            if path.keys.is_empty() {
                continue;
            }
            if let Some(g) = root.get(&path.keys) {
                g.collect_names(start, end, path.recursive, &mut names);
            }
        }
        if names.is_empty() {
            return vec![self.cfg.default_index.clone()];
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}
