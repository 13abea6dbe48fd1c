//! 乐观更新日志
//!
//! 每个键最多一条未决编辑。在前一条编辑确认之前再次提出修改时，
//! 新编辑沿用最初的回滚目标，被取代的写入记录在 `superseded` 中，
//! 直到它们自己的结果或回显到达。

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};

/// 乐观更新ID
pub type MutationId = String;

pub fn new_mutation_id() -> MutationId {
    uuid::Uuid::new_v4().to_string()
}

/// 一条未决的乐观编辑
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEdit<V> {
    pub mutation_id: MutationId,
    /// 失败时恢复的值，None 表示该键此前没有已确认的值
    pub rollback_target: Option<V>,
    pub proposed: V,
    pub issued_at: DateTime<Utc>,
    /// 视图作用域（离开视图时取消其看门狗）
    pub scope: Option<String>,
    /// 被取代但仍在途的写入，按提出顺序
    pub superseded: Vec<(MutationId, V)>,
}

/// 编辑日志：键 → 单槽未决编辑
#[derive(Debug)]
pub struct EditJournal<K, V> {
    edits: HashMap<K, OptimisticEdit<V>>,
}

impl<K, V> Default for EditJournal<K, V> {
    fn default() -> Self {
        Self {
            edits: HashMap::new(),
        }
    }
}

impl<K, V> EditJournal<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次新的提议
    ///
    /// 返回被取代的编辑ID（如果有）。
    pub fn begin(
        &mut self,
        key: K,
        mutation_id: MutationId,
        proposed: V,
        confirmed: Option<V>,
        scope: Option<String>,
    ) -> Option<MutationId> {
        let (rollback_target, superseded, replaced) = match self.edits.remove(&key) {
            Some(previous) => {
                let mut superseded = previous.superseded;
                superseded.push((previous.mutation_id.clone(), previous.proposed));
                (previous.rollback_target, superseded, Some(previous.mutation_id))
            }
            None => (confirmed, Vec::new(), None),
        };

        self.edits.insert(
            key,
            OptimisticEdit {
                mutation_id,
                rollback_target,
                proposed,
                issued_at: Utc::now(),
                scope,
                superseded,
            },
        );
        replaced
    }

    pub fn get(&self, key: &K) -> Option<&OptimisticEdit<V>> {
        self.edits.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut OptimisticEdit<V>> {
        self.edits.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<OptimisticEdit<V>> {
        self.edits.remove(key)
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.edits.keys().copied()
    }
}
